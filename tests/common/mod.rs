//! Shared fixtures for integration tests
//!
//! Nodes run the real hyper server on an ephemeral 127.0.0.1 port with an
//! in-memory key backend.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use keywarden::config::Args;
use keywarden::custodial_keys::crypto;
use keywarden::custodial_keys::{
    KeyCustodian, KeyCustodianConfig, KeyRing, KeyRingConfig, SecretEscrow,
};
use keywarden::directory::NoDirectory;
use keywarden::server::{self, AppState, Surface};
use keywarden::storage::MemoryBackend;
use sequoia_openpgp::cert::{CertBuilder, CipherSuite};
use sequoia_openpgp::crypto::Password;
use sequoia_openpgp::Cert;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const MASTER_PASSPHRASE: &str = "master key passphrase";

/// Cv25519 key with signing and encryption subkeys, protected by `passphrase`.
pub fn test_cert(user_id: &str, passphrase: &str) -> Cert {
    let (cert, _) = CertBuilder::new()
        .set_cipher_suite(CipherSuite::Cv25519)
        .add_userid(user_id)
        .add_signing_subkey()
        .add_transport_encryption_subkey()
        .set_password(Some(Password::from(passphrase)))
        .generate()
        .unwrap();
    cert
}

pub fn armored_secret(cert: &Cert) -> String {
    crypto::armor_secret(cert).unwrap()
}

pub fn fingerprint(cert: &Cert) -> String {
    crypto::cert_fingerprint(cert)
}

/// Escrow around `master`, as every replica of one cluster would load it.
pub async fn escrow_for(master: &Cert) -> SecretEscrow {
    SecretEscrow::with_master_key(&armored_secret(master), MASTER_PASSPHRASE)
        .await
        .unwrap()
}

pub fn custodian() -> Arc<KeyCustodian> {
    let keyring = Arc::new(KeyRing::new(KeyRingConfig::default(), Arc::new(NoDirectory)));
    Arc::new(KeyCustodian::new(
        KeyCustodianConfig::default(),
        keyring,
        Arc::new(MemoryBackend::new()),
    ))
}

pub struct TestNode {
    pub addr: SocketAddr,
    pub base_url: String,
    pub custodian: Arc<KeyCustodian>,
    pub escrow: Arc<SecretEscrow>,
    task: JoinHandle<()>,
}

impl TestNode {
    /// The `host:port` string peers know this node by.
    pub fn peer_id(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_node(escrow: SecretEscrow) -> TestNode {
    start_node_with(custodian(), escrow, Surface::Combined).await
}

pub async fn start_node_with(
    custodian: Arc<KeyCustodian>,
    escrow: SecretEscrow,
    surface: Surface,
) -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let args = Args::try_parse_from(["keywarden", "--listen", &addr.to_string()]).unwrap();

    let escrow = Arc::new(escrow);
    let state = Arc::new(AppState::new(args, Arc::clone(&custodian), Arc::clone(&escrow)));
    let task = tokio::spawn(server::serve(listener, state, surface));

    TestNode {
        addr,
        base_url: format!("http://{}", addr),
        custodian,
        escrow,
        task,
    }
}
