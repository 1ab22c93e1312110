//! Fixed-key block cipher for the encrypted monitor family.
//!
//! Traffic is AES-CBC with a zero IV over whole 16-byte blocks, no padding.
//! The key is a protocol constant baked into every device of the family;
//! there is no key exchange.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::ProtocolError;

type CbcEnc = cbc::Encryptor<aes::Aes128>;
type CbcDec = cbc::Decryptor<aes::Aes128>;

/// Cipher block size; all wire traffic is a multiple of this.
pub const BLOCK_SIZE: usize = 16;

/// The family key: "leagend" + 0xFF 0xFE + "0100009".
const KEY: [u8; 16] = *b"leagend\xff\xfe0100009";

const ZERO_IV: [u8; 16] = [0u8; 16];

fn check_len(data: &[u8]) -> Result<(), ProtocolError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::framing(
            format!("length {} is not a multiple of {BLOCK_SIZE}", data.len()),
            data,
        ));
    }
    Ok(())
}

/// Encrypt whole blocks. Fails on any length that is not a positive multiple
/// of 16 bytes.
pub fn encrypt(plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    check_len(plaintext)?;
    Ok(CbcEnc::new(&KEY.into(), &ZERO_IV.into())
        .encrypt_padded_vec_mut::<NoPadding>(plaintext))
}

/// Decrypt whole blocks. Fails on any length that is not a positive multiple
/// of 16 bytes.
pub fn decrypt(ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    check_len(ciphertext)?;
    CbcDec::new(&KEY.into(), &ZERO_IV.into())
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| ProtocolError::framing("unpad failure", ciphertext))
}

/// Zero-pad a short command to one block.
pub fn pad_block(payload: &[u8]) -> Result<[u8; BLOCK_SIZE], ProtocolError> {
    if payload.len() > BLOCK_SIZE {
        return Err(ProtocolError::framing(
            format!("payload {} bytes exceeds one block", payload.len()),
            payload,
        ));
    }
    let mut block = [0u8; BLOCK_SIZE];
    block[..payload.len()].copy_from_slice(payload);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_block() {
        let plain: [u8; 16] = *b"0123456789abcdef";
        let cipher = encrypt(&plain).unwrap();
        assert_eq!(cipher.len(), 16);
        assert_ne!(&cipher[..], &plain[..]);
        assert_eq!(decrypt(&cipher).unwrap(), plain);
    }

    #[test]
    fn round_trip_multi_block() {
        let plain: Vec<u8> = (0..48).collect();
        let cipher = encrypt(&plain).unwrap();
        assert_eq!(cipher.len(), 48);
        assert_eq!(decrypt(&cipher).unwrap(), plain);
    }

    #[test]
    fn round_trip_both_directions() {
        // decrypt(encrypt(x)) = x and encrypt(decrypt(x)) = x
        let x: [u8; 16] = [
            0xd1, 0x55, 0x07, 0x00, 0xfb, 0x00, 0x55, 0x04, 0xec, 0, 0, 0, 0, 0, 0, 0,
        ];
        assert_eq!(decrypt(&encrypt(&x).unwrap()).unwrap(), x);
        assert_eq!(encrypt(&decrypt(&x).unwrap()).unwrap(), x);
    }

    #[test]
    fn rejects_partial_blocks() {
        assert!(matches!(
            encrypt(&[0u8; 15]),
            Err(ProtocolError::Framing { .. })
        ));
        assert!(matches!(
            decrypt(&[0u8; 17]),
            Err(ProtocolError::Framing { .. })
        ));
        assert!(matches!(encrypt(&[]), Err(ProtocolError::Framing { .. })));
    }

    #[test]
    fn pad_block_zero_fills() {
        let block = pad_block(&[0xd1, 0x55, 0x07]).unwrap();
        assert_eq!(&block[..3], &[0xd1, 0x55, 0x07]);
        assert!(block[3..].iter().all(|&b| b == 0));
        assert!(pad_block(&[0u8; 17]).is_err());
    }
}
