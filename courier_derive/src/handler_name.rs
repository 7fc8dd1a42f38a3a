//! Derive macro for generating queue handler names.
//!
//! This module provides the `HandlerName` derive macro that automatically
//! generates a `handler_name()` method for handler structs.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, LitStr};

/// Converts a PascalCase or camelCase identifier to kebab-case.
///
/// Examples:
/// - `AppRefresh` -> `app-refresh`
/// - `ChangeAggregator` -> `change-aggregator`
/// - `HTTPFanout` -> `http-fanout`
fn to_kebab_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    let mut prev_was_lowercase = false;
    let mut prev_was_uppercase = false;

    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            // Hyphen on a camelCase boundary, or at the end of an acronym
            if i > 0 {
                let next_is_lowercase =
                    s.chars().nth(i + 1).is_some_and(|next| next.is_lowercase());
                if prev_was_lowercase || (prev_was_uppercase && next_is_lowercase) {
                    result.push('-');
                }
            }
            result.push(c.to_ascii_lowercase());
            prev_was_uppercase = true;
            prev_was_lowercase = false;
        } else {
            result.push(c);
            prev_was_lowercase = c.is_lowercase();
            prev_was_uppercase = false;
        }
    }

    result
}

/// Implementation of the `HandlerName` derive macro.
///
/// # Attributes
///
/// - `#[handler_name("custom")]` - Override the generated name. The `handler:` prefix is kept.
/// - `#[handler_name(prefix = "stage")]` - Use a different prefix instead of `handler`.
/// - `#[handler_name(name = "custom", prefix = "stage")]` - Custom name and prefix.
pub fn handler_name_impl(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let item_tokens: TokenStream = item.into();
    let input = match syn::parse2::<DeriveInput>(item_tokens) {
        Ok(tree) => tree,
        Err(e) => return e.to_compile_error().into(),
    };

    if !matches!(&input.data, Data::Struct(_)) {
        return syn::Error::new_spanned(&input, "HandlerName can only be derived for structs")
            .to_compile_error()
            .into();
    }

    let struct_name = &input.ident;
    let struct_name_str = struct_name.to_string();
    let (impl_generics, type_generics, where_clause) = input.generics.split_for_impl();

    let mut custom_name: Option<String> = None;
    let mut prefix = "handler".to_string();

    for attr in &input.attrs {
        if attr.path().is_ident("handler_name") {
            if let Ok(lit) = attr.parse_args::<LitStr>() {
                custom_name = Some(lit.value());
                continue;
            }

            let result = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let value: LitStr = meta.value()?.parse()?;
                    custom_name = Some(value.value());
                    Ok(())
                } else if meta.path.is_ident("prefix") {
                    let value: LitStr = meta.value()?.parse()?;
                    prefix = value.value();
                    Ok(())
                } else {
                    Err(meta.error("expected `name` or `prefix`"))
                }
            });

            if let Err(e) = result {
                return e.to_compile_error().into();
            }
        }
    }

    // First match wins: Handler, Consumer, Worker
    let name = custom_name.unwrap_or_else(|| {
        let stripped = struct_name_str
            .strip_suffix("Handler")
            .or_else(|| struct_name_str.strip_suffix("Consumer"))
            .or_else(|| struct_name_str.strip_suffix("Worker"))
            .unwrap_or(&struct_name_str);
        to_kebab_case(stripped)
    });

    let handler_name = format!("{}:{}", prefix, name);

    let expanded = quote! {
        impl #impl_generics ::courier_core::HandlerName for #struct_name #type_generics #where_clause {
            fn handler_name(&self) -> &str {
                #handler_name
            }
        }
    };

    expanded.into()
}
