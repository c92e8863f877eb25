use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr, Type};

struct MessageVariant<'a> {
    ident: &'a syn::Ident,
    payload: &'a Type,
    name: String,
}

fn wire_name(variant: &syn::Variant) -> syn::Result<String> {
    let mut name = variant.ident.to_string();
    for attr in &variant.attrs {
        if attr.path().is_ident("message") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let value: LitStr = meta.value()?.parse()?;
                    name = value.value();
                    Ok(())
                } else {
                    Err(meta.error("expected `name`"))
                }
            })?;
        }
    }
    Ok(name)
}

pub fn message_data_enum_impl(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let item_tokens: proc_macro2::TokenStream = item.into();
    let input = match syn::parse2::<DeriveInput>(item_tokens) {
        Ok(tree) => tree,
        Err(e) => return e.to_compile_error().into(),
    };

    let enum_name = &input.ident;
    let variants = match &input.data {
        Data::Enum(data) => &data.variants,
        _ => {
            return syn::Error::new_spanned(&input, "MessageData can only be derived for enums")
                .to_compile_error()
                .into();
        }
    };

    let mut messages = Vec::with_capacity(variants.len());
    for variant in variants {
        let payload = match &variant.fields {
            Fields::Unnamed(fields) if fields.unnamed.len() == 1 => &fields.unnamed[0].ty,
            _ => {
                return syn::Error::new_spanned(
                    variant,
                    "MessageData variants must wrap exactly one payload type",
                )
                .to_compile_error()
                .into();
            }
        };
        let name = match wire_name(variant) {
            Ok(name) => name,
            Err(e) => return e.to_compile_error().into(),
        };
        messages.push(MessageVariant {
            ident: &variant.ident,
            payload,
            name,
        });
    }

    let name_arms = messages.iter().map(|m| {
        let ident = m.ident;
        let name = &m.name;
        quote! { #enum_name::#ident(..) => #name, }
    });

    let names = messages.iter().map(|m| &m.name);

    let encode_arms = messages.iter().map(|m| {
        let ident = m.ident;
        quote! { #enum_name::#ident(inner) => ::tickets_core::serde_json::to_vec(inner), }
    });

    let decode_arms = messages.iter().map(|m| {
        let ident = m.ident;
        let name = &m.name;
        quote! {
            #name => ::tickets_core::serde_json::from_slice(payload)
                .map(#enum_name::#ident)
                .map_err(|source| ::tickets_core::DecodeError::Malformed {
                    name: name.to_string(),
                    source,
                }),
        }
    });

    let conversions = messages.iter().map(|m| {
        let ident = m.ident;
        let payload = m.payload;
        let name = &m.name;
        quote! {
            impl ::tickets_core::NamedMessage for #payload {
                const NAME: &'static str = #name;
            }

            impl ::core::convert::From<#payload> for #enum_name {
                fn from(value: #payload) -> Self {
                    #enum_name::#ident(value)
                }
            }

            impl ::core::convert::TryFrom<#enum_name> for #payload {
                type Error = ::tickets_core::UnexpectedMessage;

                #[allow(unreachable_patterns)]
                fn try_from(value: #enum_name) -> ::core::result::Result<Self, Self::Error> {
                    match value {
                        #enum_name::#ident(inner) => Ok(inner),
                        other => Err(::tickets_core::UnexpectedMessage {
                            expected: #name,
                            found: ::tickets_core::MessageData::message_name(&other),
                        }),
                    }
                }
            }
        }
    });

    let expanded = quote! {
        impl ::tickets_core::MessageData for #enum_name {
            fn message_name(&self) -> &'static str {
                match self {
                    #(#name_arms)*
                }
            }

            fn message_names() -> &'static [&'static str] {
                &[#(#names),*]
            }

            fn encode(&self) -> ::core::result::Result<::std::vec::Vec<u8>, ::tickets_core::serde_json::Error> {
                match self {
                    #(#encode_arms)*
                }
            }

            fn decode(
                name: &str,
                payload: &[u8],
            ) -> ::core::result::Result<Self, ::tickets_core::DecodeError> {
                match name {
                    #(#decode_arms)*
                    other => Err(::tickets_core::DecodeError::UnknownMessage(other.to_string())),
                }
            }
        }

        #(#conversions)*
    };

    expanded.into()
}
