use anyhow::Result;

use super::fingerprint::{fetch_fingerprint, fingerprint, BundleData, VOLATILE_CONFIG_KEYS};
use crate::fixtures::{bundle, MemBundles};

#[test]
fn fingerprint_is_invariant_to_insertion_order() {
    let mut forward = BundleData::default();
    forward.insert("alpha".into(), b"one".to_vec());
    forward.insert("beta".into(), b"two".to_vec());
    forward.insert("gamma".into(), b"three".to_vec());

    let mut reversed = BundleData::default();
    reversed.insert("gamma".into(), b"three".to_vec());
    reversed.insert("beta".into(), b"two".to_vec());
    reversed.insert("alpha".into(), b"one".to_vec());

    let lhs = fingerprint(&forward, &[]);
    let rhs = fingerprint(&reversed, &[]);
    assert_eq!(lhs, rhs, "expected identical digests regardless of insertion order, got {} and {}", lhs, rhs);
}

#[test]
fn fingerprint_changes_with_any_value_change() {
    let base = bundle(&[("search.yml", "a"), ("log4j2.properties", "b")]);
    let changed = bundle(&[("search.yml", "a"), ("log4j2.properties", "c")]);

    let lhs = fingerprint(&base, &[]);
    let rhs = fingerprint(&changed, &[]);
    assert_ne!(lhs, rhs, "expected a changed value to change the digest");
}

#[test]
fn fingerprint_changes_when_a_key_is_added_or_removed() {
    let base = bundle(&[("search.yml", "a")]);
    let added = bundle(&[("search.yml", "a"), ("extra", "b")]);

    assert_ne!(fingerprint(&base, &[]), fingerprint(&added, &[]), "expected an added key to change the digest");
    assert_ne!(fingerprint(&added, &[]), fingerprint(&base, &[]), "expected a removed key to change the digest");
}

#[test]
fn fingerprint_ignores_volatile_keys() {
    let base = bundle(&[("search.yml", "a"), ("index_settings", "generated-1")]);
    let regenerated = bundle(&[("search.yml", "a"), ("index_settings", "generated-2")]);

    let lhs = fingerprint(&base, VOLATILE_CONFIG_KEYS);
    let rhs = fingerprint(&regenerated, VOLATILE_CONFIG_KEYS);
    assert_eq!(lhs, rhs, "expected volatile key changes to leave the digest untouched, got {} and {}", lhs, rhs);
}

#[test]
fn fingerprint_of_empty_bundle_is_empty() {
    let digest = fingerprint(&BundleData::default(), &[]);
    assert!(digest.is_empty(), "expected empty digest for empty bundle, got {}", digest);
}

#[tokio::test]
async fn fetch_fingerprint_returns_empty_digest_for_missing_bundle() -> Result<()> {
    let bundles = MemBundles::default();

    let digest = fetch_fingerprint(&bundles, "absent", "default", &[]).await?;

    assert!(digest.is_empty(), "expected empty digest for missing bundle, got {}", digest);
    Ok(())
}

#[tokio::test]
async fn fetch_fingerprint_hashes_present_bundle() -> Result<()> {
    let bundles = MemBundles::default();
    bundles.set("search", bundle(&[("tls.crt", "cert")]));

    let digest = fetch_fingerprint(&bundles, "search", "default", &[]).await?;

    assert!(!digest.is_empty(), "expected non-empty digest for present bundle");
    assert_eq!(digest.len(), 64, "expected one sha-256 hex digest per key, got len {}", digest.len());
    Ok(())
}
