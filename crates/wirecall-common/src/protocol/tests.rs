//! Tests for call framing
//!
//! These tests verify invocation encoding, request/response frame layout and
//! the error responses a server sends back.

#[cfg(test)]
mod tests {
    use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

    use super::super::*;
    use crate::wire::{read_string, DeclaredType, TypeRegistry, TypedValue};

    fn sample_invocation() -> Invocation {
        Invocation::new(
            "add",
            vec![TypedValue::of(2i32), TypedValue::of(vec![1i64, 2])],
        )
    }

    #[test]
    fn test_invocation_layout() {
        let mut out: Vec<u8> = Vec::new();
        Invocation::new("ping", vec![]).write(&mut out).unwrap();
        assert_eq!(out, vec![0, 4, b'p', b'i', b'n', b'g', 0, 0, 0, 0]);
    }

    #[test]
    fn test_invocation_param_types() {
        let invocation = sample_invocation();
        assert_eq!(
            invocation.param_types(),
            vec![
                &DeclaredType::Int,
                &DeclaredType::Array(Box::new(DeclaredType::Long))
            ]
        );
        assert_eq!(invocation.to_string(), "add(2, [1, 2])");
    }

    #[test]
    fn test_request_frame_roundtrip() {
        let frame = RequestFrame::Call {
            call_id: 17,
            invocation: sample_invocation(),
        };
        let body = frame.encode().unwrap();
        assert_eq!(peek_call_id(&body), Some(17));
        assert_eq!(RequestFrame::decode(&body, &TypeRegistry::new()).unwrap(), frame);
    }

    #[test]
    fn test_ping_frame() {
        let body = encode_ping();
        assert_eq!(body, vec![0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(
            RequestFrame::decode(&body, &TypeRegistry::new()).unwrap(),
            RequestFrame::Ping
        );
    }

    #[test]
    fn test_negative_parameter_count() {
        let mut body: Vec<u8> = Vec::new();
        body.write_i32::<BigEndian>(5).unwrap();
        body.extend_from_slice(&[0, 1, b'f']);
        body.write_i32::<BigEndian>(-3).unwrap();
        let err = RequestFrame::decode(&body, &TypeRegistry::new()).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[test]
    fn test_peek_call_id_short_body() {
        assert_eq!(peek_call_id(&[0, 0]), None);
    }

    // ========================================================================
    // Responses
    // ========================================================================

    #[test]
    fn test_success_response_roundtrip() {
        let frame = ResponseFrame::new(3, Response::Value(TypedValue::of("ok".to_string())));
        let body = frame.encode().unwrap();
        assert_eq!(&body[..5], &[0, 0, 0, 3, 0]);
        assert_eq!(ResponseFrame::decode(&body, &TypeRegistry::new()).unwrap(), frame);
    }

    #[test]
    fn test_error_response_layout() {
        let frame = ResponseFrame::new(
            9,
            Response::Error {
                class: "java.io.IOException".to_string(),
                message: "disk full".to_string(),
            },
        );
        let body = frame.encode().unwrap();

        let mut input = &body[..];
        assert_eq!(input.read_i32::<BigEndian>().unwrap(), 9);
        assert_eq!(input.read_u8().unwrap(), 1);
        assert_eq!(read_string(&mut input).unwrap(), "java.io.IOException");
        assert_eq!(read_string(&mut input).unwrap(), "disk full");
        assert!(input.is_empty());
    }

    #[test]
    fn test_unknown_status_is_protocol_error() {
        let body = [0, 0, 0, 1, 7];
        let err = ResponseFrame::decode(&body, &TypeRegistry::new()).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[test]
    fn test_response_from_local_error() {
        let response = Response::from_result(Err(RpcError::protocol("bad method")));
        assert_eq!(
            response,
            Response::Error {
                class: "wirecall.ProtocolError".to_string(),
                message: "Protocol error: bad method".to_string(),
            }
        );
    }

    #[test]
    fn test_remote_error_passes_through() {
        let response = Response::from_result(Err(RpcError::Remote {
            class: "app.Denied".to_string(),
            message: "nope".to_string(),
        }));
        match response.into_result() {
            Err(RpcError::Remote { class, message }) => {
                assert_eq!(class, "app.Denied");
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_connection_header_roundtrip() {
        let header = ConnectionHeader::new("demo.EchoProtocol");
        let bytes = header.to_bytes().unwrap();
        assert_eq!(ConnectionHeader::from_bytes(&bytes).unwrap(), header);
    }
}
