//! Derive macro for naming queue payloads.
//!
//! Every variant of a payload enum wraps exactly one message, e.g. `App(EntityMessage)`.
//! The generated `payload_type()` returns the variant name, which handlers use when they
//! reject a payload that does not belong on their queue.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Variant};

pub fn payload_type_enum_impl(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    match expand(item.into()) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(item: TokenStream) -> syn::Result<TokenStream> {
    let input = syn::parse2::<DeriveInput>(item)?;
    let enum_name = &input.ident;
    let variants = match &input.data {
        Data::Enum(data) => &data.variants,
        _ => {
            return Err(syn::Error::new_spanned(
                &input,
                "PayloadType can only be derived for a payload enum",
            ));
        }
    };

    let arms = variants
        .iter()
        .map(|variant| payload_arm(enum_name, variant))
        .collect::<syn::Result<Vec<_>>>()?;

    Ok(quote! {
        impl ::courier_core::PayloadType for #enum_name {
            fn payload_type(&self) -> &'static str {
                match self {
                    #(#arms)*
                }
            }
        }
    })
}

fn payload_arm(enum_name: &syn::Ident, variant: &Variant) -> syn::Result<TokenStream> {
    let variant_name = &variant.ident;
    match &variant.fields {
        Fields::Unnamed(fields) if fields.unnamed.len() == 1 => {
            let name = variant_name.to_string();
            Ok(quote! { #enum_name::#variant_name(_) => #name, })
        }
        _ => Err(syn::Error::new_spanned(
            variant,
            format!(
                "Payload variant `{}` must wrap exactly one message, e.g. `{}(EntityMessage)`",
                variant_name, variant_name
            ),
        )),
    }
}
