//! Crypto Module - Ed25519 Identität
//!
//! - Erzeugen und Speichern des Schlüsselpaars im Datenverzeichnis
//! - Signieren und Prüfen der Signale zwischen Peers

mod keypair;

pub use keypair::{KeyPair, KeyPairError};
