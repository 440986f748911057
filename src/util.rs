use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, SentryFutureExt, TransactionContext};
use std::any::Any;
use std::future::Future;

/// Try to figure out what's in the box, and render it if we can.
///
/// The payload from `catch_unwind` is commonly, but not always, a
/// `&'static str` or a `String`. Anything else is reported without detail.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

/// Run `callback` inside a fresh Sentry scope with a transaction spanning
/// the job execution, so errors reported from job code are grouped per
/// worker.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let hub = Hub::new_from_top(Hub::current());
    let ctx = TransactionContext::new(transaction_name, "oban.perform");
    let transaction = sentry_core::start_transaction(ctx);

    hub.configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));

    let result = callback().bind_hub(hub).await;

    transaction.set_status(match result {
        Ok(_) => SpanStatus::Ok,
        Err(_) => SpanStatus::UnknownError,
    });
    transaction.finish();

    result
}
