use super::*;

#[test]
fn bearer_prefixes_token() {
    let session = Session::new("u-1", "abc123");
    assert_eq!(session.bearer(), "Bearer abc123");
    assert_eq!(session.user_id(), "u-1");
    assert_eq!(session.token(), "abc123");
}

#[test]
fn debug_output_redacts_token() {
    let session = Session::new("u-1", "super-secret");
    let rendered = format!("{session:?}");
    assert!(rendered.contains("u-1"));
    assert!(!rendered.contains("super-secret"));
}
