//! Cross-language test harness: encrypt.
//!
//! Reads JSON from stdin with hex-encoded Ed25519 seeds and plaintext,
//! seals with NaCl box, and writes the sealed bytes as hex JSON to
//! stdout. Peer implementations run the matching decrypt step to prove
//! wire compatibility.

use std::process::ExitCode;

use pinch_crypto::convert::keypair_to_x25519;
use pinch_crypto::{encrypt, Keypair};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
struct Input {
    ed25519_seed_sender: String,
    ed25519_seed_recipient: String,
    plaintext: String,
}

#[derive(Serialize)]
struct Output {
    sealed: String,
}

fn decode_seed(field: &str, value: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(value).map_err(|e| format!("invalid {field} hex: {e}"))?;
    bytes
        .try_into()
        .map_err(|_| format!("{field} must be 32 bytes"))
}

fn run() -> Result<(), String> {
    let input: Input = serde_json::from_reader(std::io::stdin())
        .map_err(|e| format!("failed to decode input: {e}"))?;

    let sender_seed = decode_seed("ed25519_seed_sender", &input.ed25519_seed_sender)?;
    let recipient_seed = decode_seed("ed25519_seed_recipient", &input.ed25519_seed_recipient)?;
    let plaintext =
        hex::decode(&input.plaintext).map_err(|e| format!("invalid plaintext hex: {e}"))?;

    let (sender_priv, _) = keypair_to_x25519(&Keypair::from_seed(&sender_seed));
    let (_, recipient_pub) = keypair_to_x25519(&Keypair::from_seed(&recipient_seed));

    let sealed =
        encrypt(&plaintext, &recipient_pub, &sender_priv).map_err(|e| e.to_string())?;

    let output = Output {
        sealed: hex::encode(sealed),
    };
    serde_json::to_writer(std::io::stdout(), &output)
        .map_err(|e| format!("failed to encode output: {e}"))?;
    println!();
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}
