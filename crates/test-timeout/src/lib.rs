use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// `(secs)` or `(secs, paused)`; both parts optional.
struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        if input.is_empty() {
            return Ok(args);
        }
        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            args.secs = lit.base10_parse()?;
            if args.secs == 0 {
                return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
            }
            if input.is_empty() {
                return Ok(args);
            }
            input.parse::<Token![,]>()?;
        }
        let flag: Ident = input.parse()?;
        if flag != "paused" {
            return Err(syn::Error::new(flag.span(), "expected `paused`"));
        }
        args.paused = true;
        if !input.is_empty() {
            return Err(input.error("unexpected tokens after `paused`"));
        }
        Ok(args)
    }
}

/// Run an async test on a fresh current-thread runtime and fail it if it does
/// not finish within the wall-clock limit.
///
/// With `paused` the runtime starts with tokio's clock paused, so timers
/// auto-advance and only the wall-clock watchdog applies.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let secs = args.secs;
    let body = if args.paused {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move #block);
        }
    } else {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    let watched = watchdog(secs, body);
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watched
        }
    })
}

/// Synchronous counterpart of [`tokio_timeout_test`].
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() || args.paused {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test function and no `paused` flag",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !attr.path().is_ident("test"))
        .collect();

    let watched = watchdog(args.secs, quote! { #block });
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watched
        }
    })
}

/// Runs `body` on its own thread and re-raises its panic, or panics itself
/// when the thread has not reported back after `secs` seconds.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
