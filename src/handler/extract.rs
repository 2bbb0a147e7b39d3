use super::error::ApiError;
use axum::{
    body::Bytes,
    extract::{FromRequest, Request},
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// JSON body extractor that never rejects on content. A missing content type,
/// an empty or unparseable body, and `null` fields all read as absent, so the
/// handler's own validation produces the `{ ok: false, error }` answer.
pub struct LenientJson<T>(pub T);

/// Object fields that are `null` are dropped before deserializing; anything
/// that still does not fit yields `T::default()`.
pub fn parse_lenient<T>(body: &[u8]) -> T
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return T::default();
    }
    let value = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(mut fields)) => {
            fields.retain(|_, v| !v.is_null());
            Value::Object(fields)
        }
        Ok(other) => other,
        Err(e) => {
            debug!("unparseable request body: {}", e);
            return T::default();
        }
    };
    serde_json::from_value(value).unwrap_or_else(|e| {
        debug!("request body does not match: {}", e);
        T::default()
    })
}

impl<T, S> FromRequest<S> for LenientJson<T>
where
    T: DeserializeOwned + Default,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        Ok(LenientJson(parse_lenient(&body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::StartCallRequest;

    #[test]
    fn test_bad_bodies_read_as_empty() {
        for body in ["", "  ", "not json", "[1,2]", r#"{"plate":null}"#, r#"{"plate":5}"#] {
            let req: StartCallRequest = parse_lenient(body.as_bytes());
            assert!(req.plate.is_empty(), "{body}");
        }
    }

    #[test]
    fn test_null_fields_do_not_discard_the_rest() {
        let req: StartCallRequest =
            parse_lenient(br#"{"plate":"UP14AB1234","via":null,"caller_info":null}"#);
        assert_eq!(req.plate, "UP14AB1234");
        assert!(req.via.is_none());
    }
}
