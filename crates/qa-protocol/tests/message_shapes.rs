//! Wire-shape tests: typed bodies against the frozen JSON field names, and
//! frame reassembly under worst-case socket fragmentation.

use qa_protocol::{
    Body, FrameDecoder, Logon, LogonUser, Privileges, Pubmsg, Role, encode,
};
use serde_json::json;

#[test]
fn logon_serializes_with_frozen_field_names() {
    let logon = Body::Logon(Logon {
        user: LogonUser {
            username: "Guest1234".to_owned(),
            privileges: Privileges {
                role: Role::User,
                muted: None,
            },
        },
        server: qa_protocol::ProtocolInfo::default(),
    });

    assert_eq!(
        logon.to_value(),
        json!({
            "type": "logon",
            "user": {
                "username": "Guest1234",
                "privileges": {"type": "user"}
            },
            "server": {"protocol": "QAServ1.0", "client": "QA_QT1.0"}
        })
    );
}

#[test]
fn quit_is_tag_only() {
    assert_eq!(Body::Quit.to_value(), json!({"type": "quit"}));
    assert_eq!(Body::from_value(&json!({"type": "quit"})).unwrap(), Body::Quit);
}

#[test]
fn unknown_type_tag_is_an_error() {
    let err = Body::from_value(&json!({"type": "frobnicate"}));
    assert!(err.is_err());
}

#[test]
fn admin_role_round_trips() {
    let value = json!({
        "type": "logon",
        "user": {
            "username": "instructor",
            "privileges": {"type": "admin", "muted": false}
        },
        "server": {"protocol": "QAServ1.0", "client": "QA_QT1.0"}
    });
    match Body::from_value(&value).unwrap() {
        Body::Logon(logon) => {
            assert_eq!(logon.user.privileges.role, Role::Admin);
            assert_eq!(logon.user.privileges.muted, Some(false));
        }
        other => panic!("expected logon, got {other:?}"),
    }
}

#[test]
fn every_body_survives_encode_decode() {
    let bodies = vec![
        Body::Pubmsg(Pubmsg {
            msg: "hello".to_owned(),
            username: Some("Guest1".to_owned()),
            timestamp: Some(1_754_000_000),
        }),
        Body::Room(qa_protocol::Room {
            users: vec!["a".to_owned(), "b".to_owned()],
            topic: "soldering".to_owned(),
        }),
        Body::Entrance(qa_protocol::Entrance {
            username: "c".to_owned(),
            timestamp: 1,
        }),
        Body::Exit(qa_protocol::Exit {
            username: "c".to_owned(),
            timestamp: 2,
        }),
        Body::SidentVerify(qa_protocol::SidentVerify { timestamp: 3 }),
        Body::SidentResponse(qa_protocol::SidentResponse {
            ip_addr: "10.0.0.7".to_owned(),
            port: 9665,
            timestamp: 4,
            signature: "c2ln".to_owned(),
        }),
        Body::AddressRequest(qa_protocol::AddressRequest { timestamp: 5 }),
        Body::ServerAddress(qa_protocol::ServerAddress {
            key: "a2V5".to_owned(),
            address: "10.0.0.7".to_owned(),
            port: 9665,
            address_timestamp: 6,
            signature: "c2ln".to_owned(),
            timestamp: 7,
        }),
        Body::Quit,
    ];

    for body in bodies {
        let bytes = encode(&body.to_value());
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        let decoded = decoder.next_frame().unwrap().expect("one full frame");
        assert_eq!(Body::from_value(&decoded).unwrap(), body);
        assert!(decoder.next_frame().unwrap().is_none());
    }
}

#[test]
fn two_frames_reassemble_from_single_byte_chunks() {
    let first = Body::Pubmsg(Pubmsg {
        msg: "hello".to_owned(),
        username: Some("a".to_owned()),
        timestamp: Some(10),
    });
    let second = Body::Screenshot(qa_protocol::Screenshot {
        screenshot: "aGVsbG8=".to_owned(),
        username: Some("b".to_owned()),
        timestamp: Some(11),
    });

    let mut wire = encode(&first.to_value());
    wire.extend_from_slice(&encode(&second.to_value()));

    let mut decoder = FrameDecoder::new();
    let mut decoded = Vec::new();
    for byte in wire {
        decoder.extend(&[byte]);
        while let Some(body) = decoder.next_frame().unwrap() {
            decoded.push(Body::from_value(&body).unwrap());
        }
    }
    assert_eq!(decoded, vec![first, second]);
}
