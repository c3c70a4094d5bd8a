#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    use crate::encoding::{b64_decode, b64_encode};
    use crate::envelope::{open, pack_with, Envelope, EnvelopeError, PackRequest, SignatureCheck};
    use crate::keycard::KeyCard;
    use crate::keys::{EncryptionKeypair, SigningKeypair};
    use crate::streaming::{decrypt_to_vec, encrypt_to_vec, StreamKey};
    use crate::wire::{TlvReader, TlvWriter};

    fn keys_from_seed(seed: u64, n: usize) -> (SigningKeypair, Vec<EncryptionKeypair>) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let sender = SigningKeypair::generate_with(&mut rng);
        let recipients = (0..n).map(|_| EncryptionKeypair::generate_with(&mut rng)).collect();
        (sender, recipients)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Any recipient of a packed envelope can open it, verified.
        #[test]
        fn test_envelope_round_trip(
            payload in proptest::collection::vec(any::<u8>(), 1..2048),
            scope in "[ug]:[0-9]{1,6}(:[0-9]{1,6})?",
            n in 1usize..5,
            pick in any::<prop::sample::Index>(),
            seed in any::<u64>(),
        ) {
            let (sender, recipients) = keys_from_seed(seed, n);
            let pubs: Vec<_> = recipients.iter().map(|r| r.public_key()).collect();
            let req = PackRequest {
                msg_type: "text",
                payload: &payload,
                dialog_scope: &scope,
                sender_id: "7",
                sender: &sender,
                recipients: &pubs,
                embed_sender_keyset: false,
            };
            let mut rng = ChaCha20Rng::seed_from_u64(seed ^ 1);
            let env = pack_with(&req, &mut rng, 1).unwrap();

            let me = &recipients[pick.index(n)];
            let opened = open(&env, me, Some(&sender.verify_key())).unwrap();
            prop_assert_eq!(opened.plaintext, payload);
            prop_assert_eq!(opened.signature, SignatureCheck::Verified);
        }

        // Flipping any single bit of the ciphertext, a wrapped key or the
        // signature never yields a successful verified open.
        #[test]
        fn test_envelope_bit_flip_detected(
            which in 0usize..3,
            pos in any::<prop::sample::Index>(),
            bit in 0u8..8,
            seed in any::<u64>(),
        ) {
            let (sender, recipients) = keys_from_seed(seed, 2);
            let pubs: Vec<_> = recipients.iter().map(|r| r.public_key()).collect();
            let req = PackRequest {
                msg_type: "text",
                payload: b"tamper target",
                dialog_scope: "u:1:2",
                sender_id: "1",
                sender: &sender,
                recipients: &pubs,
                embed_sender_keyset: false,
            };
            let mut env = pack_with(&req, &mut ChaCha20Rng::seed_from_u64(seed), 1).unwrap();
            let target: &mut Vec<u8> = match which {
                0 => &mut env.ciphertext,
                1 => &mut env.recipients[0].wrapped,
                _ => &mut env.signature,
            };
            let i = pos.index(target.len());
            target[i] ^= 1 << bit;

            let err = open(&env, &recipients[0], Some(&sender.verify_key())).unwrap_err();
            prop_assert!(matches!(err, EnvelopeError::HashMismatch | EnvelopeError::BadSignature));
        }

        // The binary form re-derives the exact signed header.
        #[test]
        fn test_binary_header_stable(seed in any::<u64>(), created in 1i64..i64::MAX) {
            let (sender, recipients) = keys_from_seed(seed, 3);
            let pubs: Vec<_> = recipients.iter().map(|r| r.public_key()).collect();
            let req = PackRequest {
                msg_type: "file",
                payload: b"x",
                dialog_scope: "g:1",
                sender_id: "",
                sender: &sender,
                recipients: &pubs,
                embed_sender_keyset: seed % 2 == 0,
            };
            let env = pack_with(&req, &mut ChaCha20Rng::seed_from_u64(seed), created).unwrap();
            let decoded = Envelope::from_binary(&env.to_binary()).unwrap();
            prop_assert_eq!(decoded.header_bytes(), env.header_bytes());
        }

        #[test]
        fn test_b64_round_trip(data in any::<Vec<u8>>()) {
            prop_assert_eq!(b64_decode(&b64_encode(&data)).unwrap(), data);
        }

        #[test]
        fn test_tlv_strings_round_trip(tag in 1u32..1000, s in ".*") {
            let mut w = TlvWriter::new();
            w.put_string(tag, &s);
            let mut r = TlvReader::new(w.as_bytes());
            let (t, v) = r.next_field().unwrap().unwrap();
            prop_assert_eq!(t, tag);
            prop_assert_eq!(v.as_string(t).unwrap(), s);
        }

        #[test]
        fn test_safety_number_shape(seed in any::<u64>()) {
            let (sender, recipients) = keys_from_seed(seed, 1);
            let card = KeyCard::create(&sender, &recipients[0], None).unwrap();
            let sn = card.safety_number();
            prop_assert_eq!(sn.len(), 65);
            prop_assert_eq!(sn.matches('\n').count(), 1);
            prop_assert!(sn.chars().all(|c| c.is_ascii_digit() || c == ' ' || c == '\n'));
        }

        #[test]
        fn test_stream_round_trip(data in proptest::collection::vec(any::<u8>(), 0..20_000)) {
            let key = StreamKey::generate();
            let ct = encrypt_to_vec(&key, b"aad", &data).unwrap();
            prop_assert_eq!(decrypt_to_vec(&key, b"aad", &ct).unwrap(), data);
        }
    }
}
