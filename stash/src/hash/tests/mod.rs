use super::*;

use crate::error::StashError;

#[test]
fn test_basic() {
    let hash = Hash::sha256_from_bytes(b"hello world");

    let expected_base16 =
        "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    assert_eq!(expected_base16, hash.to_typed_base16());
    assert_eq!(expected_base16, hash.to_string());
}

#[test]
fn test_from_typed() {
    let base16 = "sha256:baeabdb75c223d171800c17b05c5e7e8e9980723a90eb6ffcc632a305afc5a42";
    let hash = Hash::from_typed(base16).unwrap();
    assert_eq!(base16, hash.to_typed_base16());

    assert!(matches!(
        Hash::from_typed("sha256"),
        Err(StashError::HashError(Error::NoColonSeparator))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:"),
        Err(StashError::HashError(Error::InvalidHashStringLength { .. }))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:gggggggggggggggggggggggggggggggggggggggggggggggggggggggggggggggg"),
        Err(StashError::HashError(Error::InvalidBase16Hash(_)))
    ));

    assert!(matches!(
        Hash::from_typed("md5:invalid"),
        Err(StashError::HashError(Error::UnsupportedHashAlgorithm(alg))) if alg == "md5"
    ));
}

#[test]
fn test_serde() {
    let hash = Hash::sha256_from_bytes(b"stash");
    let json = serde_json::to_string(&hash).unwrap();
    assert_eq!(format!("\"{}\"", hash.to_typed_base16()), json);

    let parsed: Hash = serde_json::from_str(&json).unwrap();
    assert_eq!(hash, parsed);
}
