//! Ownership proofs and coinjoin witnesses for the accepted script types.
//!
//! An ownership proof signs [`ownership_message`], which commits to the round
//! and the coin:
//!
//! - P2WPKH: 33-byte compressed public key followed by a 64-byte compact
//!   ECDSA signature. The key must hash to the coin's script.
//! - Taproot: 64-byte BIP-340 signature by the output key.
//!
//! Witnesses are checked as key-path spends: `SIGHASH_ALL` for P2WPKH,
//! `SIGHASH_DEFAULT` or `SIGHASH_ALL` for Taproot.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{ecdsa, schnorr, Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{CompressedPublicKey, Script, ScriptBuf, Transaction, TxOut, Witness};

use wabisabi_core::{Coin, RoundId, ScriptType, SignatureVerifier};

const OWNERSHIP_TAG: &[u8] = b"WabiSabi/ownership-proof";

/// Message an ownership proof for `coin` in `round_id` signs.
pub fn ownership_message(coin: &Coin, round_id: &RoundId) -> Message {
    let mut engine = sha256::Hash::engine();
    engine.input(OWNERSHIP_TAG);
    engine.input(round_id.as_bytes());
    engine.input(coin.outpoint.txid.as_byte_array());
    engine.input(&coin.outpoint.vout.to_le_bytes());
    engine.input(coin.script_pubkey().as_bytes());
    Message::from_digest(sha256::Hash::from_engine(engine).to_byte_array())
}

fn p2wpkh_key(script: &Script, bytes: &[u8]) -> Option<CompressedPublicKey> {
    let key = CompressedPublicKey::from_slice(bytes).ok()?;
    (ScriptBuf::new_p2wpkh(&key.wpubkey_hash()).as_script() == script).then_some(key)
}

fn taproot_key(script: &Script) -> Option<XOnlyPublicKey> {
    XOnlyPublicKey::from_slice(script.as_bytes().get(2..34)?).ok()
}

/// [`SignatureVerifier`] backed by libsecp256k1.
pub struct Secp256k1Verifier {
    secp: Secp256k1<VerifyOnly>,
}

impl Default for Secp256k1Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Secp256k1Verifier {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::verification_only(),
        }
    }

    fn verify_p2wpkh_witness(&self, tx: &Transaction, index: usize, spent: &TxOut, witness: &Witness) -> Option<()> {
        if witness.len() != 2 {
            return None;
        }
        let signature = bitcoin::ecdsa::Signature::from_slice(witness.nth(0)?).ok()?;
        if signature.sighash_type != EcdsaSighashType::All {
            return None;
        }
        let key = p2wpkh_key(&spent.script_pubkey, witness.nth(1)?)?;

        let sighash = SighashCache::new(tx)
            .p2wpkh_signature_hash(index, &spent.script_pubkey, spent.value, EcdsaSighashType::All)
            .ok()?;
        let message = Message::from_digest(sighash.to_byte_array());
        self.secp.verify_ecdsa(&message, &signature.signature, &key.0).ok()
    }

    fn verify_taproot_witness(&self, tx: &Transaction, index: usize, prevouts: &[TxOut], witness: &Witness) -> Option<()> {
        if witness.len() != 1 {
            return None;
        }
        let signature = bitcoin::taproot::Signature::from_slice(witness.nth(0)?).ok()?;
        if !matches!(signature.sighash_type, TapSighashType::Default | TapSighashType::All) {
            return None;
        }
        let key = taproot_key(&prevouts.get(index)?.script_pubkey)?;

        let sighash = SighashCache::new(tx)
            .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), signature.sighash_type)
            .ok()?;
        let message = Message::from_digest(sighash.to_byte_array());
        self.secp.verify_schnorr(&signature.signature, &message, &key).ok()
    }
}

impl SignatureVerifier for Secp256k1Verifier {
    fn verify_ownership_proof(&self, coin: &Coin, proof: &[u8], round_id: &RoundId) -> bool {
        let message = ownership_message(coin, round_id);
        match coin.script_type() {
            Some(ScriptType::P2wpkh) if proof.len() == 33 + 64 => {
                let Some(key) = p2wpkh_key(coin.script_pubkey(), &proof[..33]) else {
                    return false;
                };
                ecdsa::Signature::from_compact(&proof[33..])
                    .map(|sig| self.secp.verify_ecdsa(&message, &sig, &key.0).is_ok())
                    .unwrap_or(false)
            }
            Some(ScriptType::Taproot) if proof.len() == 64 => {
                let Some(key) = taproot_key(coin.script_pubkey()) else {
                    return false;
                };
                schnorr::Signature::from_slice(proof)
                    .map(|sig| self.secp.verify_schnorr(&sig, &message, &key).is_ok())
                    .unwrap_or(false)
            }
            _ => false,
        }
    }

    fn verify_witness(&self, tx: &Transaction, input_index: usize, prevouts: &[TxOut], witness: &Witness) -> bool {
        if prevouts.len() != tx.input.len() {
            return false;
        }
        let Some(spent) = prevouts.get(input_index) else {
            return false;
        };
        let verified = match ScriptType::from_script(&spent.script_pubkey) {
            Some(ScriptType::P2wpkh) => self.verify_p2wpkh_witness(tx, input_index, spent, witness),
            Some(ScriptType::Taproot) => self.verify_taproot_witness(tx, input_index, prevouts, witness),
            None => None,
        };
        verified.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::key::{Keypair, TapTweak};
    use bitcoin::secp256k1::{rand, All, PublicKey, SecretKey};
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, Sequence, TxIn};
    use wabisabi_core::testing::{outpoint, p2wpkh_script};

    fn p2wpkh_coin(secp: &Secp256k1<All>) -> (Coin, SecretKey, PublicKey) {
        let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        let script = ScriptBuf::new_p2wpkh(&CompressedPublicKey(pk).wpubkey_hash());
        let coin = Coin::new(
            outpoint(1, 0),
            TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: script,
            },
        );
        (coin, sk, pk)
    }

    fn spend(coin: &Coin) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: coin.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(99_000),
                script_pubkey: p2wpkh_script(9),
            }],
        }
    }

    #[test]
    fn test_p2wpkh_ownership_proof() {
        let secp = Secp256k1::new();
        let (coin, sk, pk) = p2wpkh_coin(&secp);
        let round_id = RoundId::new();

        let sig = secp.sign_ecdsa(&ownership_message(&coin, &round_id), &sk);
        let proof = [CompressedPublicKey(pk).to_bytes().as_slice(), &sig.serialize_compact()].concat();

        let verifier = Secp256k1Verifier::new();
        assert!(verifier.verify_ownership_proof(&coin, &proof, &round_id));
        // Bound to the round.
        assert!(!verifier.verify_ownership_proof(&coin, &proof, &RoundId::new()));
        // Key must match the script.
        let (_, other) = secp.generate_keypair(&mut rand::thread_rng());
        let forged = [CompressedPublicKey(other).to_bytes().as_slice(), &sig.serialize_compact()].concat();
        assert!(!verifier.verify_ownership_proof(&coin, &forged, &round_id));
    }

    #[test]
    fn test_taproot_ownership_proof() {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        let (internal, _) = keypair.x_only_public_key();
        let coin = Coin::new(
            outpoint(2, 0),
            TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: ScriptBuf::new_p2tr(&secp, internal, None),
            },
        );
        let round_id = RoundId::new();

        let tweaked = keypair.tap_tweak(&secp, None).to_inner();
        let sig = secp.sign_schnorr_no_aux_rand(&ownership_message(&coin, &round_id), &tweaked);

        let verifier = Secp256k1Verifier::new();
        assert!(verifier.verify_ownership_proof(&coin, &sig.serialize(), &round_id));
        assert!(!verifier.verify_ownership_proof(&coin, &[0u8; 64], &round_id));
    }

    #[test]
    fn test_p2wpkh_witness() {
        let secp = Secp256k1::new();
        let (coin, sk, pk) = p2wpkh_coin(&secp);
        let tx = spend(&coin);

        let sighash = SighashCache::new(&tx)
            .p2wpkh_signature_hash(0, coin.script_pubkey(), coin.amount(), EcdsaSighashType::All)
            .unwrap();
        let sig = secp.sign_ecdsa(&Message::from_digest(sighash.to_byte_array()), &sk);
        let witness = Witness::p2wpkh(&bitcoin::ecdsa::Signature::sighash_all(sig), &pk);

        let verifier = Secp256k1Verifier::new();
        let prevouts = vec![coin.tx_out.clone()];
        assert!(verifier.verify_witness(&tx, 0, &prevouts, &witness));
        assert!(!verifier.verify_witness(&tx, 0, &prevouts, &Witness::new()));
        assert!(!verifier.verify_witness(&tx, 1, &prevouts, &witness));

        let mut tampered = tx.clone();
        tampered.output[0].value = Amount::from_sat(98_000);
        assert!(!verifier.verify_witness(&tampered, 0, &prevouts, &witness));
    }

    #[test]
    fn test_taproot_witness() {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        let (internal, _) = keypair.x_only_public_key();
        let coin = Coin::new(
            outpoint(3, 0),
            TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: ScriptBuf::new_p2tr(&secp, internal, None),
            },
        );
        let tx = spend(&coin);
        let prevouts = vec![coin.tx_out.clone()];

        let sighash = SighashCache::new(&tx)
            .taproot_key_spend_signature_hash(0, &Prevouts::All(&prevouts), TapSighashType::Default)
            .unwrap();
        let tweaked = keypair.tap_tweak(&secp, None).to_inner();
        let signature = secp.sign_schnorr_no_aux_rand(&Message::from_digest(sighash.to_byte_array()), &tweaked);
        let witness = Witness::p2tr_key_spend(&bitcoin::taproot::Signature {
            signature,
            sighash_type: TapSighashType::Default,
        });

        assert!(Secp256k1Verifier::new().verify_witness(&tx, 0, &prevouts, &witness));
    }
}
