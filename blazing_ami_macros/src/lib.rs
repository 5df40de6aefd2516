//! This crate is a companion to `blazing_ami`. Please see its documentation for more information.
//!
//! We provide proc_macros that enable a neat API in the main crate: lifting a single async fn
//! into a zero-sized type that implements exactly one method of a multi-method hook trait
//! (`ConnectionHandler`, `ChannelHandler`, `AsyncAgiHandler`), leaving every other method at its
//! default no-op.
use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Ident, ItemFn};

/// Lift an async fn into a type implementing exactly one method of `ConnectionHandler`.
///
/// The argument names which hook is being filled in: `banner_received`, `new_channel`, or
/// `event`. The fn must use the same parameter names and types as the corresponding
/// `ConnectionHandler` method (minus `&self`); see that trait's documentation.
///
/// ```ignore
/// #[connection_handler(new_channel)]
/// async fn log_new_channel(name: &str, channel: blazing_ami::channel::ChannelRef) {
///     println!("new channel: {name}");
/// }
/// ```
#[proc_macro_attribute]
pub fn connection_handler(attr: TokenStream, input: TokenStream) -> TokenStream {
    let hook = parse_macro_input!(attr as Ident);
    let input = parse_macro_input!(input as ItemFn);
    let fn_name = input.sig.ident;
    let fn_block = input.block;
    let struct_name = Ident::new(
        format!("BlazingAmiConnectionHandler_{fn_name}").as_str(),
        Span::call_site(),
    );

    let method = match hook.to_string().as_str() {
        "banner_received" => quote! {
            async fn banner_received(&self, banner: &str) {
                #fn_block
            }
        },
        "new_channel" => quote! {
            async fn new_channel(&self, name: &str, channel: ::blazing_ami::channel::ChannelRef) {
                #fn_block
            }
        },
        "event" => quote! {
            async fn event(&self, name: &str, headers: &::blazing_ami::message::Headers) {
                #fn_block
            }
        },
        other => {
            let msg = format!("unknown ConnectionHandler hook `{other}`");
            return syn::Error::new(hook.span(), msg).to_compile_error().into();
        }
    };

    let tokens = quote! {
        #[derive(Debug, Clone)]
        struct #struct_name {}
        #[::async_trait::async_trait]
        impl ::blazing_ami::handler::ConnectionHandler for #struct_name {
            #method
        }
        #[allow(non_upper_case_globals)]
        const #fn_name: #struct_name = #struct_name {};
    };
    tokens.into()
}

/// Lift an async fn into a type implementing exactly one method of `ChannelHandler`.
///
/// The argument names which hook is being filled in, e.g. `hung_up`, `linked`, `variable_set`.
/// See `ChannelHandler` for the full list and signatures.
#[proc_macro_attribute]
pub fn channel_handler(attr: TokenStream, input: TokenStream) -> TokenStream {
    let hook = parse_macro_input!(attr as Ident);
    let input = parse_macro_input!(input as ItemFn);
    let fn_name = input.sig.ident;
    let fn_block = input.block;
    let struct_name = Ident::new(
        format!("BlazingAmiChannelHandler_{fn_name}").as_str(),
        Span::call_site(),
    );

    let method = match hook.to_string().as_str() {
        "new_state" => quote! {
            async fn new_state(&self, state: u8, desc: &str) {
                #fn_block
            }
        },
        "new_caller_id" => quote! {
            async fn new_caller_id(&self, number: Option<&str>, name: Option<&str>) {
                #fn_block
            }
        },
        "variable_set" => quote! {
            async fn variable_set(&self, variable: &str, value: &str) {
                #fn_block
            }
        },
        "extension_entered" => quote! {
            async fn extension_entered(
                &self,
                context: &str,
                extension: &str,
                priority: i32,
                application: &str,
                app_data: &str,
            ) {
                #fn_block
            }
        },
        "renamed" => quote! {
            async fn renamed(&self, old_name: &str, new_name: &str) {
                #fn_block
            }
        },
        "linked" => quote! {
            async fn linked(&self, peer: ::blazing_ami::channel::ChannelRef) {
                #fn_block
            }
        },
        "unlinked" => quote! {
            async fn unlinked(&self, peer: ::blazing_ami::channel::ChannelRef) {
                #fn_block
            }
        },
        "dial_begun" => quote! {
            async fn dial_begun(&self, destination: &str, dial_string: Option<&str>) {
                #fn_block
            }
        },
        "dial_ended" => quote! {
            async fn dial_ended(&self, dial_status: Option<&str>) {
                #fn_block
            }
        },
        "hung_up" => quote! {
            async fn hung_up(&self, cause: i32, cause_text: &str) {
                #fn_block
            }
        },
        other => {
            let msg = format!("unknown ChannelHandler hook `{other}`");
            return syn::Error::new(hook.span(), msg).to_compile_error().into();
        }
    };

    let tokens = quote! {
        #[derive(Debug, Clone)]
        struct #struct_name {}
        #[::async_trait::async_trait]
        impl ::blazing_ami::channel::ChannelHandler for #struct_name {
            #method
        }
        #[allow(non_upper_case_globals)]
        const #fn_name: #struct_name = #struct_name {};
    };
    tokens.into()
}

/// Lift an async fn into a type implementing `AsyncAgiHandler::async_agi_started`.
#[proc_macro_attribute]
pub fn async_agi_handler(attr: TokenStream, input: TokenStream) -> TokenStream {
    // Only one hook currently exists on this trait; the argument is still required so call
    // sites read the same way as `connection_handler`/`channel_handler` and stay future-proof.
    let hook = parse_macro_input!(attr as Ident);
    if hook != "async_agi_started" {
        let msg = format!("unknown AsyncAgiHandler hook `{hook}`");
        return syn::Error::new(hook.span(), msg).to_compile_error().into();
    }
    let input = parse_macro_input!(input as ItemFn);
    let fn_name = input.sig.ident;
    let fn_block = input.block;
    let struct_name = Ident::new(
        format!("BlazingAmiAsyncAgiHandler_{fn_name}").as_str(),
        Span::call_site(),
    );

    let tokens = quote! {
        #[derive(Debug, Clone)]
        struct #struct_name {}
        #[::async_trait::async_trait]
        impl ::blazing_ami::asyncagi::AsyncAgiHandler for #struct_name {
            async fn async_agi_started(
                &self,
                context: &str,
                extension: &str,
                priority: i32,
                env: &::std::collections::HashMap<String, String>,
            ) {
                #fn_block
            }
        }
        #[allow(non_upper_case_globals)]
        const #fn_name: #struct_name = #struct_name {};
    };
    tokens.into()
}
