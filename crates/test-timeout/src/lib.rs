//! Test attributes that fail a test instead of letting it hang.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(5)]
//! async fn finishes_quickly() { /* ... */ }
//!
//! #[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
//! async fn needs_worker_threads() { /* ... */ }
//!
//! #[test_timeout::timeout(secs = 2)]
//! fn sync_test() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ItemFn, Lit, LitInt, MetaNameValue, Token};

const DEFAULT_SECS: u64 = 60;

#[derive(Clone, Copy)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Args {
    secs: u64,
    flavor: Flavor,
}

fn parse_args(attr: TokenStream, allow_flavor: bool) -> syn::Result<Args> {
    let mut args = Args {
        secs: DEFAULT_SECS,
        flavor: Flavor::CurrentThread,
    };
    if attr.is_empty() {
        return Ok(args);
    }

    if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
        args.secs = lit.base10_parse()?;
    } else {
        let pairs = Punctuated::<MetaNameValue, Token![,]>::parse_terminated.parse(attr)?;
        for pair in pairs {
            if pair.path.is_ident("secs") {
                match &pair.value {
                    Expr::Lit(ExprLit {
                        lit: Lit::Int(lit), ..
                    }) => args.secs = lit.base10_parse()?,
                    other => return Err(syn::Error::new_spanned(other, "secs must be an integer")),
                }
            } else if allow_flavor && pair.path.is_ident("flavor") {
                args.flavor = match &pair.value {
                    Expr::Lit(ExprLit {
                        lit: Lit::Str(lit), ..
                    }) => match lit.value().as_str() {
                        "current_thread" => Flavor::CurrentThread,
                        "multi_thread" => Flavor::MultiThread,
                        _ => {
                            return Err(syn::Error::new_spanned(
                                lit,
                                "flavor must be \"current_thread\" or \"multi_thread\"",
                            ))
                        }
                    },
                    other => return Err(syn::Error::new_spanned(other, "flavor must be a string")),
                };
            } else {
                return Err(syn::Error::new_spanned(&pair.path, "unknown argument"));
            }
        }
    }

    if args.secs == 0 {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "timeout must be greater than zero",
        ));
    }
    Ok(args)
}

/// Run `body` on a named thread and fail the test if it does not report back within
/// `secs`. Panics inside the body are re-raised on the test thread.
fn guarded(name: &str, secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name(String::from(#name))
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = sender.send(result);
            });
        if let Err(err) = spawned {
            panic!("could not spawn test thread: {err}");
        }
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test {} exceeded {}s", #name, #secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test {} exited without reporting", #name)
            }
        }
    }
}

fn strip_attrs(attrs: Vec<Attribute>, drop: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !drop(attr)).collect()
}

fn path_is(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|s| s.ident.to_string())
        .collect();
    segments == expected
}

/// Async test on a fresh tokio runtime, bounded by a wall-clock timeout.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr, true) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };
    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, |attr| path_is(attr, &["tokio", "test"]));
    let name = sig.ident.to_string();
    let secs = args.secs;
    let builder = match args.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => quote! { tokio::runtime::Builder::new_multi_thread() },
    };
    let body = quote! {
        let runtime = match #builder.enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => panic!("could not build tokio runtime: {err}"),
        };
        runtime.block_on(async move {
            if tokio::time::timeout(timeout_duration, async move #block).await.is_err() {
                panic!("test {} exceeded {}s", #name, #secs);
            }
        });
    };
    let guarded = guarded(&name, secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}

/// Synchronous test bounded by a wall-clock timeout.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr, false) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };
    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "timeout expects a synchronous fn")
            .to_compile_error()
            .into();
    }

    let attrs = strip_attrs(attrs, |attr| path_is(attr, &["test"]));
    let name = sig.ident.to_string();
    let guarded = guarded(&name, args.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}
