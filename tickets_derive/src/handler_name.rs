//! Derive macro for generating stable handler names.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, LitStr};

/// Strips the conventional `Handler` suffix from a struct name.
///
/// A struct named exactly `Handler` keeps its name.
fn default_name(struct_name: &str) -> String {
    match struct_name.strip_suffix("Handler") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => struct_name.to_string(),
    }
}

/// Implementation of the `HandlerName` derive macro.
///
/// # Attributes
///
/// - `#[handler_name("custom")]` - use `custom` verbatim.
/// - `#[handler_name(prefix = "ops_read_model")]` - prepend `ops_read_model.`.
/// - `#[handler_name(name = "OnBookingMade", prefix = "ops_read_model")]` - both.
pub fn handler_name_impl(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let item_tokens: TokenStream = item.into();
    let input = match syn::parse2::<DeriveInput>(item_tokens) {
        Ok(tree) => tree,
        Err(e) => return e.to_compile_error().into(),
    };

    if !matches!(input.data, Data::Struct(_)) {
        return syn::Error::new_spanned(&input, "HandlerName can only be derived for structs")
            .to_compile_error()
            .into();
    }

    let struct_name = &input.ident;
    let (impl_generics, type_generics, where_clause) = input.generics.split_for_impl();

    let mut custom_name: Option<String> = None;
    let mut prefix: Option<String> = None;

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
                    prefix = Some(value.value());
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

    let name = custom_name.unwrap_or_else(|| default_name(&struct_name.to_string()));
    let handler_name = match prefix {
        Some(prefix) => format!("{}.{}", prefix, name),
        None => name,
    };

    let expanded = quote! {
        impl #impl_generics ::tickets_core::HandlerName for #struct_name #type_generics #where_clause {
            fn handler_name(&self) -> &'static str {
                #handler_name
            }
        }
    };

    expanded.into()
}
