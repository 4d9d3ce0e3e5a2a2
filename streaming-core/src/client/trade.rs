//! Trade RPC (C8, spec.md §4.6 "High-reliability trade"): success-code
//! matching for the `trade` response, plus the optional dual-bucket
//! fan-out used when the caller asks for high reliability.

use std::sync::Arc;

use tracing::instrument;

use crate::errors::{CoreError, CoreResult};
use crate::ids::{AccountId, Bucket};
use crate::observer::Observer;
use crate::packets::RequestType;

use super::rpc::RpcRequestOptions;
use super::ClientCore;

/// `trade(accountId, trade, application?, reliability?)`'s reliability
/// knob (spec.md §4.6 scenario 6): `Regular` issues one request on the
/// account's active instance; `High` fans the identical request out to
/// both buckets and resolves on the first success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reliability {
    #[default]
    Regular,
    High,
}

/// Trade response codes that count as success (spec.md §4.6): anything
/// else becomes `CoreError::Trade`.
const SUCCESS_STRING_CODES: &[&str] = &[
    "ERR_NO_ERROR",
    "TRADE_RETCODE_PLACED",
    "TRADE_RETCODE_DONE",
    "TRADE_RETCODE_DONE_PARTIAL",
    "TRADE_RETCODE_NO_CHANGES",
];

/// Canonicalizes the `stringCode`/`numericCode` aliasing (SPEC_FULL.md Open
/// Question #1): a `stringCode` is authoritative when present; otherwise a
/// `numericCode` of zero means success and any other value means failure.
/// A response carrying neither field (e.g. not a trade response at all)
/// defaults to success.
fn is_success(result: &serde_json::Value) -> bool {
    let numeric = result.get("numericCode").and_then(|v| v.as_i64());
    let string = result.get("stringCode").and_then(|v| v.as_str());

    match (numeric, string) {
        (_, Some(code)) => SUCCESS_STRING_CODES.contains(&code),
        (Some(0), None) => true,
        (Some(_), None) => false,
        (None, None) => true,
    }
}

fn trade_error(result: serde_json::Value) -> CoreError {
    let message = result.get("message").and_then(|v| v.as_str()).unwrap_or("trade rejected").to_string();
    let numeric_code = result.get("numericCode").and_then(|v| v.as_i64());
    let string_code = result.get("stringCode").and_then(|v| v.as_str()).map(str::to_string);

    CoreError::Trade {
        message,
        numeric_code,
        string_code,
    }
}

#[instrument(skip(core, trade_payload), fields(%account_id, ?reliability))]
pub async fn trade<O: Observer>(
    core: &Arc<ClientCore<O>>,
    account_id: &AccountId,
    trade_payload: serde_json::Value,
    reliability: Reliability,
) -> CoreResult<serde_json::Value> {
    let result = match reliability {
        Reliability::Regular => {
            super::rpc::rpc_request(core, account_id, RequestType::Trade, trade_payload, None).await?
        }
        Reliability::High => trade_high_reliability(core, account_id, trade_payload).await?,
    };

    if is_success(&result) {
        Ok(result)
    } else {
        Err(trade_error(result))
    }
}

/// Issues the same trade on both buckets in parallel and resolves on the
/// first success; if every attempt rejects, the first rejection is
/// surfaced (spec.md §4.6 scenario 6).
async fn trade_high_reliability<O: Observer>(core: &Arc<ClientCore<O>>, account_id: &AccountId, trade_payload: serde_json::Value) -> CoreResult<serde_json::Value> {
    let options = |bucket: Bucket| {
        Some(RpcRequestOptions {
            instance_index: Some(bucket),
            ..Default::default()
        })
    };

    let (zero, one) = tokio::join!(
        super::rpc::rpc_request(core, account_id, RequestType::Trade, trade_payload.clone(), options(Bucket::Zero)),
        super::rpc::rpc_request(core, account_id, RequestType::Trade, trade_payload, options(Bucket::One)),
    );

    select_trade_result(zero, one)
}

/// First-success-wins selection over the two bucket attempts (spec.md §4.6
/// scenario 6: "if bucket 0 throws and bucket 1 succeeds, result is bucket
/// 1's; if both throw, bucket 0's error propagates").
fn select_trade_result(zero: CoreResult<serde_json::Value>, one: CoreResult<serde_json::Value>) -> CoreResult<serde_json::Value> {
    match (zero, one) {
        (Ok(result), Err(_)) => Ok(result),
        (Err(_), Ok(result)) => Ok(result),
        (Ok(result), Ok(_)) => Ok(result),
        (Err(first), Err(_)) => Err(first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_zero_is_success() {
        assert!(is_success(&json!({"numericCode": 0})));
    }

    #[test]
    fn known_string_codes_are_success() {
        for code in SUCCESS_STRING_CODES {
            assert!(is_success(&json!({"stringCode": code})), "{code} should be a success code");
        }
    }

    #[test]
    fn unknown_string_code_is_failure_even_with_numeric_zero() {
        // stringCode is authoritative per the numericCode/stringCode aliasing rule.
        assert!(!is_success(&json!({"numericCode": 0, "stringCode": "TRADE_RETCODE_REJECT"})));
    }

    #[test]
    fn nonzero_numeric_without_string_code_is_failure() {
        assert!(!is_success(&json!({"numericCode": 10004})));
    }

    #[test]
    fn absent_codes_default_to_success() {
        assert!(is_success(&json!({"ticket": 123})));
    }

    #[test]
    fn trade_error_reads_message_and_both_codes() {
        let err = trade_error(json!({
            "message": "Not enough money",
            "numericCode": 10019,
            "stringCode": "TRADE_RETCODE_NO_MONEY",
        }));
        match err {
            CoreError::Trade { message, numeric_code, string_code } => {
                assert_eq!(message, "Not enough money");
                assert_eq!(numeric_code, Some(10019));
                assert_eq!(string_code.as_deref(), Some("TRADE_RETCODE_NO_MONEY"));
            }
            other => panic!("expected CoreError::Trade, got {other:?}"),
        }
    }

    #[test]
    fn select_prefers_bucket_zero_when_both_succeed() {
        let zero = Ok(json!({"bucket": 0}));
        let one = Ok(json!({"bucket": 1}));
        let selected = select_trade_result(zero, one).unwrap();
        assert_eq!(selected, json!({"bucket": 0}));
    }

    #[test]
    fn select_falls_back_to_bucket_one_when_zero_throws() {
        let zero: CoreResult<serde_json::Value> = Err(CoreError::Timeout);
        let one = Ok(json!({"bucket": 1}));
        let selected = select_trade_result(zero, one).unwrap();
        assert_eq!(selected, json!({"bucket": 1}));
    }

    #[test]
    fn select_surfaces_bucket_zero_error_when_both_throw() {
        let zero: CoreResult<serde_json::Value> = Err(CoreError::Timeout);
        let one: CoreResult<serde_json::Value> = Err(CoreError::NotAuthenticated);
        let err = select_trade_result(zero, one).unwrap_err();
        assert!(matches!(err, CoreError::Timeout));
    }
}
