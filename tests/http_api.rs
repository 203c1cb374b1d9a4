//! HTTP API integration tests
//!
//! Drives the management and cluster endpoints of a live server.

mod common;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::{
    armored_secret, custodian, escrow_for, fingerprint, start_node, start_node_with, test_cert,
    TestNode,
};
use keywarden::custodial_keys::SecretEscrow;
use keywarden::server::Surface;
use serde_json::{json, Value};

const PASSPHRASE: &str = "open sesame";

async fn node_with_master() -> TestNode {
    let master = test_cert("Master", common::MASTER_PASSPHRASE);
    start_node(escrow_for(&master).await).await
}

async fn post(node: &TestNode, path: &str, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(node.url(path))
        .json(&body)
        .send()
        .await
        .unwrap()
}

/// Add a fresh key through the API, optionally unlocking it.
async fn add_key(node: &TestNode, unlock: bool) -> String {
    let cert = test_cert("Alice <alice@example.org>", PASSPHRASE);
    let mut body = json!({ "EncryptedPrivateKey": armored_secret(&cert) });
    if unlock {
        body["Password"] = json!(PASSPHRASE);
    }
    let response = post(node, "/keyRing/addPrivateKey", body).await;
    assert_eq!(response.status(), 200);
    let added: Value = response.json().await.unwrap();
    assert_eq!(added["FingerPrint"], fingerprint(&cert));
    assert!(added["PublicKey"]
        .as_str()
        .unwrap()
        .contains("BEGIN PGP PUBLIC KEY BLOCK"));
    fingerprint(&cert)
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_reports_escrow_state() {
    let node = node_with_master().await;
    let health: Value = reqwest::get(node.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["healthy"], true);
    assert_eq!(health["status"], "online");
    assert_eq!(health["escrow"]["degraded"], false);

    let degraded = start_node(SecretEscrow::degraded()).await;
    let response = reqwest::get(degraded.url("/healthz")).await.unwrap();
    assert_eq!(response.status(), 200);
    let health: Value = response.json().await.unwrap();
    assert_eq!(health["status"], "degraded");
}

// =============================================================================
// Key ring
// =============================================================================

#[tokio::test]
async fn test_add_private_key_with_password_unlocks_and_escrows() {
    let node = node_with_master().await;
    let fp = add_key(&node, true).await;

    let keys: Vec<Value> = reqwest::get(node.url("/keyRing/privateKeys"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entry = keys.iter().find(|k| k["FingerPrint"] == fp).unwrap();
    assert_eq!(entry["ContainsPrivateKey"], true);
    assert_eq!(entry["PrivateKeyIsDecrypted"], true);

    assert!(node.escrow.get_passphrases().await.contains_key(&fp));
}

#[tokio::test]
async fn test_add_private_key_rejects_garbage() {
    let node = node_with_master().await;
    let response = post(
        &node,
        "/keyRing/addPrivateKey",
        json!({ "EncryptedPrivateKey": "not a key" }),
    )
    .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_add_public_key_only_is_not_found() {
    let node = node_with_master().await;
    let cert = test_cert("Bob <bob@example.org>", PASSPHRASE);
    let public = keywarden::custodial_keys::crypto::armor_public(&cert).unwrap();
    let response = post(
        &node,
        "/keyRing/addPrivateKey",
        json!({ "EncryptedPrivateKey": public }),
    )
    .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_get_key() {
    let node = node_with_master().await;
    let fp = add_key(&node, false).await;

    let response = reqwest::get(node.url(&format!("/keyRing/getKey?fingerPrint={}", fp)))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .text()
        .await
        .unwrap()
        .contains("BEGIN PGP PUBLIC KEY BLOCK"));

    // Short form resolves too
    let short = &fp[fp.len() - 8..];
    let response = reqwest::get(node.url(&format!("/keyRing/getKey?fingerPrint={}", short)))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = reqwest::get(node.url("/keyRing/getKey?fingerPrint=0123456789ABCDEF"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = reqwest::get(node.url("/keyRing/getKey")).await.unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_delete_private_key() {
    let node = node_with_master().await;
    let fp = add_key(&node, true).await;

    let response = post(&node, "/keyRing/deletePrivateKey", json!({ "FingerPrint": fp })).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["Status"], "OK");

    let response = reqwest::get(node.url(&format!("/keyRing/getKey?fingerPrint={}", fp)))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = post(&node, "/keyRing/deletePrivateKey", json!({ "FingerPrint": fp })).await;
    assert_eq!(response.status(), 404);
}

// =============================================================================
// OpenPGP operations
// =============================================================================

#[tokio::test]
async fn test_unlock_key_errors() {
    let node = node_with_master().await;
    let fp = add_key(&node, false).await;

    let response = post(
        &node,
        "/gpg/unlockKey",
        json!({ "FingerPrint": fp, "Password": "wrong" }),
    )
    .await;
    assert_eq!(response.status(), 401);
    assert!(node.escrow.is_empty().await);

    let response = post(
        &node,
        "/gpg/unlockKey",
        json!({ "FingerPrint": "FFFFFFFFFFFFFFFF", "Password": PASSPHRASE }),
    )
    .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_unlock_with_short_fingerprint_escrows_canonical() {
    let node = node_with_master().await;
    let fp = add_key(&node, false).await;
    let short = fp[fp.len() - 8..].to_lowercase();

    let response = post(
        &node,
        "/gpg/unlockKey",
        json!({ "FingerPrint": short, "Password": PASSPHRASE }),
    )
    .await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");

    let escrowed = node.escrow.get_passphrases().await;
    assert_eq!(escrowed.keys().collect::<Vec<_>>(), vec![&fp]);
}

#[tokio::test]
async fn test_sign_and_verify() {
    let node = node_with_master().await;
    let fp = add_key(&node, false).await;
    let data = BASE64.encode("hello keywarden");

    let response = post(
        &node,
        "/gpg/sign",
        json!({ "FingerPrint": fp, "Base64Data": data }),
    )
    .await;
    assert_eq!(response.status(), 409);

    post(
        &node,
        "/gpg/unlockKey",
        json!({ "FingerPrint": fp, "Password": PASSPHRASE }),
    )
    .await;

    let response = post(
        &node,
        "/gpg/sign",
        json!({ "FingerPrint": fp, "Base64Data": data, "HashAlgorithm": "SHA256" }),
    )
    .await;
    assert_eq!(response.status(), 200);
    let signature = response.text().await.unwrap();
    assert!(signature.contains("BEGIN PGP SIGNATURE"));

    let response = post(
        &node,
        "/gpg/verifySignature",
        json!({ "Base64Data": data, "Signature": signature }),
    )
    .await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");

    let response = post(
        &node,
        "/gpg/verifySignature",
        json!({ "Base64Data": BASE64.encode("tampered"), "Signature": signature }),
    )
    .await;
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn test_compact_sign_and_verify() {
    let node = node_with_master().await;
    let fp = add_key(&node, true).await;
    let data = BASE64.encode("compact form");

    let response = post(
        &node,
        "/gpg/signQuanto",
        json!({ "FingerPrint": fp, "Base64Data": data }),
    )
    .await;
    assert_eq!(response.status(), 200);
    let compact = response.text().await.unwrap();
    assert!(compact.starts_with(&format!("{}_SHA512_", fp)));
    assert!(!compact.contains('\n'));

    let response = post(
        &node,
        "/gpg/verifySignatureQuanto",
        json!({ "Base64Data": data, "Signature": compact }),
    )
    .await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");

    let dollar = compact.replacen('_', "$", 2);
    let response = post(
        &node,
        "/gpg/verifySignatureQuanto",
        json!({ "Base64Data": data, "Signature": dollar }),
    )
    .await;
    assert_eq!(response.status(), 200);

    let response = post(
        &node,
        "/gpg/verifySignatureQuanto",
        json!({ "Base64Data": BASE64.encode("tampered"), "Signature": compact }),
    )
    .await;
    assert_eq!(response.status(), 422);

    let response = post(
        &node,
        "/gpg/verifySignatureQuanto",
        json!({ "Base64Data": data, "Signature": "not-compact" }),
    )
    .await;
    assert_eq!(response.status(), 400);
    let response = post(
        &node,
        "/gpg/signQuanto",
        json!({ "FingerPrint": "0123456789ABCDEF", "Base64Data": data }),
    )
    .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_encrypt_decrypt_round_trip() {
    let node = node_with_master().await;
    let fp = add_key(&node, false).await;
    let data = BASE64.encode("secret payload");

    for data_only in [false, true] {
        let response = post(
            &node,
            "/gpg/encrypt",
            json!({
                "FingerPrint": fp,
                "Base64Data": data,
                "Filename": "payload.txt",
                "DataOnly": data_only,
            }),
        )
        .await;
        assert_eq!(response.status(), 200);
        let encrypted = response.text().await.unwrap();
        assert_eq!(encrypted.contains("BEGIN PGP MESSAGE"), !data_only);

        // Locked: nobody can decrypt yet
        if !data_only {
            let response = post(
                &node,
                "/gpg/decrypt",
                json!({ "AsciiArmoredData": encrypted, "DataOnly": data_only }),
            )
            .await;
            assert_eq!(response.status(), 409);

            post(
                &node,
                "/gpg/unlockKey",
                json!({ "FingerPrint": fp, "Password": PASSPHRASE }),
            )
            .await;
        }

        let response = post(
            &node,
            "/gpg/decrypt",
            json!({ "AsciiArmoredData": encrypted, "DataOnly": data_only }),
        )
        .await;
        assert_eq!(response.status(), 200);
        let decrypted: Value = response.json().await.unwrap();
        assert_eq!(decrypted["Base64Data"], data);
        assert_eq!(decrypted["Filename"], "payload.txt");
        assert_eq!(decrypted["IsIntegrityOK"], true);
    }
}

#[tokio::test]
async fn test_generate_key_validation() {
    let node = node_with_master().await;

    let response = post(
        &node,
        "/gpg/generateKey",
        json!({ "Identifier": "Carol <carol@example.org>", "Password": "pw", "Bits": 1024 }),
    )
    .await;
    assert_eq!(response.status(), 400);

    let response = post(
        &node,
        "/gpg/generateKey",
        json!({ "Identifier": "Carol <carol@example.org>", "Password": "", "Bits": 2048 }),
    )
    .await;
    assert_eq!(response.status(), 400);

    let response = post(
        &node,
        "/gpg/generateKey",
        json!({ "Identifier": "Carol (admin) <carol@example.org>", "Password": "pw", "Bits": 2048 }),
    )
    .await;
    assert_eq!(response.status(), 400);
}

// =============================================================================
// Cluster endpoints
// =============================================================================

#[tokio::test]
async fn test_post_encrypted_passwords() {
    let node = node_with_master().await;

    let response = reqwest::Client::new()
        .post(node.url("/__internal/__postEncryptedPasswords"))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = post(
        &node,
        "/__internal/__postEncryptedPasswords",
        json!({ "0123456789ABCDEF": "ciphertext" }),
    )
    .await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/plain"
    );
    assert_eq!(response.text().await.unwrap(), "OK");

    let map: Value = reqwest::get(node.url("/__internal/__getUnlockPasswords"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(map, json!({ "0123456789ABCDEF": "ciphertext" }));
}

#[tokio::test]
async fn test_split_surfaces() {
    let master = test_cert("Master", common::MASTER_PASSPHRASE);
    let public = start_node_with(custodian(), escrow_for(&master).await, Surface::Public).await;
    let internal =
        start_node_with(custodian(), escrow_for(&master).await, Surface::Internal).await;

    let response = reqwest::get(public.url("/__internal/__getUnlockPasswords"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let response = reqwest::get(public.url("/keyRing/privateKeys")).await.unwrap();
    assert_eq!(response.status(), 200);

    let response = reqwest::get(internal.url("/__internal/__getUnlockPasswords"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let response = reqwest::get(internal.url("/keyRing/privateKeys")).await.unwrap();
    assert_eq!(response.status(), 404);

    for node in [&public, &internal] {
        let response = reqwest::get(node.url("/health")).await.unwrap();
        assert_eq!(response.status(), 200);
    }
}

#[tokio::test]
async fn test_unknown_route() {
    let node = node_with_master().await;
    let response = reqwest::get(node.url("/nope")).await.unwrap();
    assert_eq!(response.status(), 404);
}
