// SPDX-License-Identifier: AGPL-3.0-only

//! Derive macros used by `treestore` for its closed, tagged-variant enums
//! (operation kinds, insert kinds, provider kinds, ...). Design note §9 of
//! the spec calls for these to be real tagged variants rather than
//! stringly-typed conventions; `EnumCode` gives each fieldless variant a
//! stable `u8` discriminant and a checked `from_u8` without writing the
//! match arms by hand at every call site.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

#[proc_macro_derive(EnumCode)]
pub fn derive_enum_code(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let variants = match &input.data {
        Data::Enum(data) => &data.variants,
        _ => {
            return syn::Error::new_spanned(&input, "EnumCode can only be derived for enums")
                .to_compile_error()
                .into()
        }
    };
    let mut to_arms = Vec::new();
    let mut from_arms = Vec::new();
    for (code, variant) in variants.iter().enumerate() {
        if !matches!(variant.fields, Fields::Unit) {
            return syn::Error::new_spanned(
                variant,
                "EnumCode only supports fieldless (unit) variants",
            )
            .to_compile_error()
            .into();
        }
        let code = code as u8;
        let vname = &variant.ident;
        to_arms.push(quote! { Self::#vname => #code, });
        from_arms.push(quote! { #code => Some(Self::#vname), });
    }
    let expanded = quote! {
        impl #name {
            /// Stable discriminant for this variant, in declaration order.
            pub const fn code(&self) -> u8 {
                match self {
                    #(#to_arms)*
                }
            }
            /// Reconstructs a variant from a discriminant produced by `code`.
            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    #(#from_arms)*
                    _ => None,
                }
            }
        }
    };
    expanded.into()
}
