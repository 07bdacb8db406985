use proc_macro::TokenStream;
use quote::quote;

pub fn impl_ser_macro(ast: &syn::DeriveInput) -> TokenStream {
    let name = ast.ident.clone();
    match ast.data {
        syn::Data::Struct(ref data) => {
            let statements: Vec<proc_macro2::TokenStream> = data
                .fields
                .iter()
                .enumerate()
                .map(|(index, field)| serialize_field(field, index))
                .collect();

            let expanded = quote! {
                impl BitcoinSerialize for #name {
                    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
                    where
                        W: std::io::Write,
                    {
                        #(#statements)*
                        Ok(())
                    }
                }
            };
            TokenStream::from(expanded)
        }
        syn::Data::Enum(ref data) => {
            let variants: Vec<proc_macro2::TokenStream> = data
                .variants
                .iter()
                .map(|variant| serialize_variant(variant, &name))
                .collect();

            let expanded = quote! {
                impl BitcoinSerialize for #name {
                    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
                    where
                        W: std::io::Write,
                    {
                        match *self {
                            #(#variants)*
                        }
                        Ok(())
                    }
                }
            };
            TokenStream::from(expanded)
        }
        _ => unimplemented!("BtcSerialize can only be derived for structs and enums"),
    }
}

fn serialize_field(field: &syn::Field, index: usize) -> proc_macro2::TokenStream {
    match field.ident.clone() {
        Some(id) => quote! { self.#id.bitcoin_serialize(&mut target)?; },
        None => {
            let index = syn::Index::from(index);
            quote! { self.#index.bitcoin_serialize(&mut target)?; }
        }
    }
}

fn serialize_variant(variant: &syn::Variant, name: &syn::Ident) -> proc_macro2::TokenStream {
    let ident = variant.ident.clone();

    let subfields: Vec<proc_macro2::TokenStream> = variant
        .fields
        .iter()
        .map(|field| {
            if let Some(ident) = field.ident.clone() {
                quote! { ref #ident , }
            } else {
                quote!(ref inner)
            }
        })
        .collect();

    let statements: Vec<proc_macro2::TokenStream> = variant
        .fields
        .iter()
        .map(|field| {
            if let Some(ident) = field.ident.clone() {
                quote! { #ident.bitcoin_serialize(&mut target)?; }
            } else {
                quote! { inner.bitcoin_serialize(&mut target)?; }
            }
        })
        .collect();

    if !subfields.is_empty() {
        quote! { #name::#ident ( #(#subfields)* ) => {
            #(#statements)*
        },}
    } else {
        quote! { #name::#ident => {
            #(#statements)*
        },}
    }
}
