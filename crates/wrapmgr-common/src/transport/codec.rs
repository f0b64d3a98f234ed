use crate::protocol::error::Result;
use crate::protocol::{Request, Response};

/// JSON codec for frame bodies.
///
/// # Example
///
/// ```
/// use wrapmgr_common::transport::JsonCodec;
/// use wrapmgr_common::protocol::{Method, Request};
/// use serde_json::json;
///
/// let request = Request::new(Method::M3u8, json!({"adam_id": "1440818664"}));
/// let encoded = JsonCodec::encode_request(&request).unwrap();
/// let decoded = JsonCodec::decode_request(&encoded).unwrap();
/// assert_eq!(request, decoded);
/// ```
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    pub fn decode_request(data: &[u8]) -> Result<Request> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    pub fn decode_response(data: &[u8]) -> Result<Response> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Method, ReplyHeader};
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::new(Method::Lyrics, json!({"adam_id": "1", "language": "en"}));
        let encoded = JsonCodec::encode_request(&request).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(value["method"], "Lyrics");
        assert_eq!(value["args"]["language"], "en");
        assert_eq!(value["id"], request.id);
    }

    #[test]
    fn test_response_wire_shape() {
        let response = Response::failure(11, "no available instance");
        let encoded = JsonCodec::encode_response(&response).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(value["header"]["code"], ReplyHeader::FAILURE);
        assert_eq!(value["header"]["msg"], "no available instance");
        assert_eq!(JsonCodec::decode_response(&encoded).unwrap(), response);
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let body = br#"{"id": 1, "method": "Shutdown", "args": {}}"#;
        assert!(JsonCodec::decode_request(body).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(JsonCodec::decode_request(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        assert!(JsonCodec::decode_response(&[0x00]).is_err());
    }
}
