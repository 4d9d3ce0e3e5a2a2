//! RPC protocol (spec.md §4.6 `rpcRequest`): builds the request envelope,
//! rewrites to the account's active instance where the wire protocol
//! allows it, allocates/awaits a socket slot, and races the response
//! against a timeout with a bounded, policy-aware retry loop.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{instrument, warn};

use crate::errors::{CoreError, CoreResult};
use crate::ids::{AccountId, Bucket};
use crate::observer::Observer;
use crate::packets::{ProcessingError, RequestEnvelope, RequestTimestamps, RequestType, WireErrorKind};

use super::socket::{self, RpcOutcome};
use super::ClientCore;

/// Per-call overrides for `rpcRequest` (spec.md §4.6). `None` fields fall
/// back to `Config`'s defaults.
#[derive(Debug, Clone, Default)]
pub struct RpcRequestOptions {
    pub instance_index: Option<Bucket>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

/// Maps a wire `processingError` into the internal taxonomy (spec.md §7).
pub(super) fn processing_error_to_core_error(err: ProcessingError) -> CoreError {
    match err.error {
        WireErrorKind::ValidationError => CoreError::Validation(err.message),
        WireErrorKind::NotFoundError => CoreError::NotFound(err.message),
        WireErrorKind::NotSynchronizedError => CoreError::NotSynchronized,
        WireErrorKind::TimeoutError => CoreError::Timeout,
        WireErrorKind::NotAuthenticatedError => CoreError::NotAuthenticated,
        WireErrorKind::UnauthorizedError => CoreError::Unauthorized(err.message),
        WireErrorKind::TooManyRequestsError => match err.metadata {
            Some(metadata) => CoreError::TooManyRequests { metadata },
            None => CoreError::internal("tooManyRequestsError without rate limit metadata"),
        },
        WireErrorKind::TradeError => CoreError::Trade {
            message: err.message,
            numeric_code: err.numeric_code,
            string_code: err.string_code,
        },
    }
}

/// `rpcRequest(accountId, requestType, payload, options)` (spec.md §4.6).
#[instrument(skip(core, payload, options), fields(%account_id, %request_type))]
pub async fn rpc_request<O: Observer>(
    core: &Arc<ClientCore<O>>,
    account_id: &AccountId,
    request_type: RequestType,
    payload: serde_json::Value,
    options: Option<RpcRequestOptions>,
) -> CoreResult<serde_json::Value> {
    let options = options.unwrap_or_default();
    let retry_opts = &core_config(core).retry_opts;
    let max_retries = options.retries.unwrap_or(retry_opts.retries);
    let timeout = options.timeout.unwrap_or_else(|| core_config(core).request_timeout());
    let retry_exempt = request_type.is_retry_exempt();

    let mut attempt = 0u32;
    let mut delay = retry_opts.min_delay();

    loop {
        let bucket = resolve_bucket(core, account_id, request_type, options.instance_index);

        match send_once(core, account_id, request_type, bucket, payload.clone(), timeout).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;

                if retry_exempt || attempt > max_retries {
                    return Err(err);
                }

                if let CoreError::TooManyRequests { .. } = &err {
                    let Some(retry_at) = err.recommended_retry_time() else {
                        return Err(err);
                    };
                    let wait = (retry_at - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    if wait > retry_opts.max_delay() * max_retries.max(1) {
                        return Err(err);
                    }
                    tokio::time::sleep(wait).await;
                    continue;
                }

                if !err.retriable() {
                    return Err(err);
                }

                warn!(attempt, ?delay, error = %err, "rpc request failed, retrying");
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tokio::time::sleep(delay + jitter).await;
                delay = (delay * 2).min(retry_opts.max_delay());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{LimitType, RateLimitMetadata};

    fn err(kind: WireErrorKind) -> ProcessingError {
        ProcessingError {
            request_id: "r1".into(),
            error: kind,
            message: "boom".into(),
            details: None,
            metadata: None,
            numeric_code: None,
            string_code: None,
        }
    }

    #[test]
    fn not_synchronized_maps_to_retriable_core_error() {
        let mapped = processing_error_to_core_error(err(WireErrorKind::NotSynchronizedError));
        assert!(matches!(mapped, CoreError::NotSynchronized));
        assert!(mapped.retriable());
    }

    #[test]
    fn validation_and_not_found_are_not_retriable() {
        assert!(!processing_error_to_core_error(err(WireErrorKind::ValidationError)).retriable());
        assert!(!processing_error_to_core_error(err(WireErrorKind::NotFoundError)).retriable());
    }

    #[test]
    fn too_many_requests_without_metadata_becomes_internal() {
        let mapped = processing_error_to_core_error(err(WireErrorKind::TooManyRequestsError));
        assert!(matches!(mapped, CoreError::Internal(_)));
    }

    #[test]
    fn too_many_requests_with_metadata_carries_it_through() {
        let mut e = err(WireErrorKind::TooManyRequestsError);
        e.metadata = Some(RateLimitMetadata {
            limit_type: LimitType::AccountSubscriptionsPerUser,
            recommended_retry_time: None,
            locked_at_accounts: Some(3),
        });
        let mapped = processing_error_to_core_error(e);
        match mapped {
            CoreError::TooManyRequests { metadata } => {
                assert_eq!(metadata.limit_type, LimitType::AccountSubscriptionsPerUser);
                assert_eq!(metadata.locked_at_accounts, Some(3));
            }
            other => panic!("expected TooManyRequests, got {other:?}"),
        }
    }

    #[test]
    fn trade_error_carries_both_codes() {
        let mut e = err(WireErrorKind::TradeError);
        e.numeric_code = Some(10019);
        e.string_code = Some("TRADE_RETCODE_NO_MONEY".into());
        let mapped = processing_error_to_core_error(e);
        match mapped {
            CoreError::Trade { numeric_code, string_code, .. } => {
                assert_eq!(numeric_code, Some(10019));
                assert_eq!(string_code.as_deref(), Some("TRADE_RETCODE_NO_MONEY"));
            }
            other => panic!("expected Trade, got {other:?}"),
        }
    }
}

fn core_config<O: Observer>(core: &Arc<super::ClientCore<O>>) -> &crate::config::Config {
    // `ClientCore::config` is private to the module; this helper keeps the
    // rest of this file from needing a public accessor just for reads.
    &core.config
}

/// §4.6 step 1: rewrite to the account's active instance unless
/// `requestType` is in the ignored set (subscribe/synchronize/unsubscribe/
/// refreshMarketDataSubscriptions), or the caller pinned an instance index.
fn resolve_bucket<O: Observer>(core: &Arc<ClientCore<O>>, account_id: &AccountId, request_type: RequestType, pinned: Option<Bucket>) -> Bucket {
    if let Some(bucket) = pinned {
        return bucket;
    }

    if request_type.is_active_instance_rewrite_ignored() {
        return Bucket::Zero;
    }

    let latency_account = super::convert::account(account_id);
    core.active_bucket(&latency_account).unwrap_or(Bucket::Zero)
}

async fn send_once<O: Observer>(
    core: &Arc<ClientCore<O>>,
    account_id: &AccountId,
    request_type: RequestType,
    bucket: Bucket,
    extra: serde_json::Value,
    timeout: Duration,
) -> CoreResult<serde_json::Value> {
    let slot = core
        .find_slot_for_account(account_id, bucket)
        .ok_or_else(|| CoreError::internal("account is not subscribed on this instance"))?;

    slot.await_connected().await;

    let request_id = socket::random_token(32);
    let envelope = RequestEnvelope {
        request_id: request_id.clone(),
        request_type: request_type.to_string(),
        account_id: account_id.clone(),
        application: core_config(core).application.clone(),
        instance_index: Some(bucket.as_index() as u8),
        session_id: Some(slot.session_id()),
        timestamps: RequestTimestamps {
            client_processing_started: chrono::Utc::now(),
        },
        extra,
    };

    let payload = serde_json::to_value(&envelope)?;
    let rx = slot.send_request(request_id.clone(), payload).await?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(RpcOutcome::Response(response))) => Ok(response.result),
        Ok(Ok(RpcOutcome::ProcessingError(err))) => Err(processing_error_to_core_error(err)),
        Ok(Err(_)) => Err(CoreError::Cancelled),
        Err(_) => {
            slot.cancel_request(&request_id);
            Err(CoreError::Timeout)
        }
    }
}
