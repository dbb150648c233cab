//! Interceptors composable around request handling, outermost first.
// (c) 2025 Ross Younger

use std::sync::Arc;

use crate::protocol::{Context, Message};
use crate::Result;

/// What an interceptor (or the terminal handler) produces: the response
/// message, or an error that becomes an ERROR response body.
pub type MiddlewareResult = Result<Box<dyn Message>>;

/// The continuation handed to each interceptor.
pub type Next<'a> = dyn Fn(&mut Context, &dyn Message) -> MiddlewareResult + 'a;

/// An interceptor: observe or rewrite the request, call `next` (or don't),
/// observe or rewrite the response.
pub type Middleware = Arc<dyn for<'a> Fn(&mut Context, &dyn Message, &Next<'a>) -> MiddlewareResult + Send + Sync>;

/// Run `req` through `middleware` (first entry outermost) down to `terminal`.
///
/// The chain is the right-fold of the list over the terminal handler: each
/// entry decides whether and with what arguments to invoke the rest.
pub fn apply_chain<'a>(
    ctx: &mut Context,
    req: &dyn Message,
    middleware: &'a [Middleware],
    terminal: &'a Next<'a>,
) -> MiddlewareResult {
    match middleware.split_first() {
        None => terminal(ctx, req),
        Some((outer, rest)) => outer(ctx, req, &|ctx, req| {
            apply_chain(ctx, req, rest, terminal)
        }),
    }
}
