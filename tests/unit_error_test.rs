use citrine::core::errors::{ServerError, ServerErrorKind};

#[test]
fn test_moved_redirect_parse() {
    let error = ServerError::parse("MOVED 3999 127.0.0.1:6381");
    assert_eq!(
        error.kind,
        ServerErrorKind::Moved {
            slot: 3999,
            addr: "127.0.0.1:6381".to_string()
        }
    );
    assert_eq!(error.redirect(), Some((3999, "127.0.0.1:6381")));
    assert!(!error.is_retriable());
}

#[test]
fn test_ask_redirect_parse() {
    let error = ServerError::parse("ASK 12182 10.0.0.7:7002");
    assert_eq!(
        error.kind,
        ServerErrorKind::Ask {
            slot: 12182,
            addr: "10.0.0.7:7002".to_string()
        }
    );
}

#[test]
fn test_malformed_redirect_downgrades_to_unrecognized() {
    assert_eq!(
        ServerError::parse("MOVED notaslot 127.0.0.1:6381").kind,
        ServerErrorKind::Unrecognized
    );
    assert_eq!(
        ServerError::parse("MOVED 3999").kind,
        ServerErrorKind::Unrecognized
    );
    assert_eq!(
        ServerError::parse("MOVED 3999 noport").kind,
        ServerErrorKind::Unrecognized
    );
}

#[test]
fn test_prefix_classification() {
    assert_eq!(
        ServerError::parse("WRONGTYPE Operation against a key").kind,
        ServerErrorKind::WrongType
    );
    assert_eq!(
        ServerError::parse("NOAUTH Authentication required.").kind,
        ServerErrorKind::NoAuth
    );
    assert_eq!(
        ServerError::parse("CROSSSLOT Keys in request don't hash to the same slot").kind,
        ServerErrorKind::CrossSlot
    );
    assert_eq!(
        ServerError::parse("ERR unknown command").kind,
        ServerErrorKind::Unrecognized
    );
}

#[test]
fn test_retriable_kinds() {
    assert!(ServerError::parse("TRYAGAIN Multiple keys request during rehashing").is_retriable());
    assert!(ServerError::parse("CLUSTERDOWN The cluster is down").is_retriable());
    assert!(ServerError::parse("LOADING Dataset is loading").is_retriable());
    assert!(!ServerError::parse("READONLY You can't write against a replica").is_retriable());
}

#[test]
fn test_message_preserved_verbatim() {
    let line = "ERR value is not an integer or out of range";
    assert_eq!(ServerError::parse(line).to_string(), line);
}
