use std::{error, fmt};

use aes::{Aes128, Aes256};
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes128Gcm, Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;
use cipher::{
    block_padding, BlockDecryptMut, BlockEncryptMut, BlockSizeUser, InnerIvInit, Iv, IvSizeUser,
};
use crypto_bigint::{
    const_residue, impl_modulus,
    modular::constant_mod::{self, ResidueParams},
    Encoding, Random, U2048,
};
use hmac::{Hmac, Mac};
use log::debug;
use p256::elliptic_curve::sec1::Tag as Sec1Tag;
use rand::{rngs::OsRng, Rng};
use sha2::{Sha256, Sha384};

use super::message::{self, ProtocolId, SaTransform, TransformType};

const AEAD_SALT_LENGTH: usize = 4;
const AEAD_IV_LENGTH: usize = 8;
const AEAD_TAG_LENGTH: usize = 16;

type HmacSha256 = Hmac<Sha256>;
type HmacSha384 = Hmac<Sha384>;

// The configured set of transforms for one protocol, IKE or ESP.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transforms {
    entries: Vec<SaTransform>,
}

impl Transforms {
    // IKE cipher suite: encryption, optional integrity, PRF and DH group.
    pub fn ike(
        encr: TransformType,
        key_bits: u16,
        integ: Option<TransformType>,
        prf: TransformType,
        dh: TransformType,
    ) -> Transforms {
        let mut entries = vec![
            SaTransform::with_key_length(encr, key_bits),
            SaTransform::new(prf),
        ];
        if let Some(integ) = integ {
            entries.push(SaTransform::new(integ));
        }
        entries.push(SaTransform::new(dh));
        Transforms { entries }
    }

    // ESP cipher suite: encryption, optional integrity and sequence number mode.
    pub fn esp(
        encr: TransformType,
        key_bits: u16,
        integ: Option<TransformType>,
        esn: TransformType,
    ) -> Transforms {
        let mut entries = vec![SaTransform::with_key_length(encr, key_bits)];
        if let Some(integ) = integ {
            entries.push(SaTransform::new(integ));
        }
        entries.push(SaTransform::new(esn));
        Transforms { entries }
    }

    pub fn entries(&self) -> &[SaTransform] {
        &self.entries
    }

    pub fn get_type(&self, transform_type: u8) -> Option<&SaTransform> {
        self.entries
            .iter()
            .find(|tr| tr.transform_type.type_id().0 == transform_type)
    }

    pub fn replace(&mut self, transform: SaTransform) {
        let type_id = transform.transform_type.type_id().0;
        self.entries
            .retain(|tr| tr.transform_type.type_id().0 != type_id);
        self.entries.push(transform);
    }

    pub fn dh_group(&self) -> Option<u16> {
        self.get_type(TransformType::TYPE_DH)
            .map(|tr| tr.transform_type.type_id().1)
    }

    pub fn without(&self, transform_type: u8) -> Transforms {
        Transforms {
            entries: self
                .entries
                .iter()
                .filter(|tr| tr.transform_type.type_id().0 != transform_type)
                .cloned()
                .collect(),
        }
    }

    // Checks if this configured set occurs within the list of proposed transforms.
    pub fn within(&self, proposed: &[SaTransform]) -> bool {
        self.entries.iter().all(|target| {
            proposed
                .iter()
                .any(|tr| tr.transform_type == target.transform_type && tr.key_length == target.key_length)
        })
    }

    pub fn to_proposal(&self, protocol_id: ProtocolId, spi: &[u8]) -> message::Proposal {
        message::Proposal {
            number: 1,
            protocol_id,
            spi: spi.to_vec(),
            transforms: self.entries.clone(),
        }
    }
}

// Default suites follow the StrongSwan Suite B style recommendations.
pub fn default_ike_transforms() -> Transforms {
    Transforms::ike(
        TransformType::ENCR_CHACHA20_POLY1305,
        256,
        None,
        TransformType::PRF_HMAC_SHA2_256,
        TransformType::DH_256_ECP,
    )
}

pub fn default_esp_transforms() -> Transforms {
    Transforms::esp(
        TransformType::ENCR_CHACHA20_POLY1305,
        256,
        None,
        TransformType::NO_ESN,
    )
}

pub struct NegotiatedSa {
    pub proposal_number: u8,
    pub remote_spi: Vec<u8>,
}

// Accepts the first proposal whose transform set is a superset of the local
// configured set.
pub fn negotiate(
    local: &Transforms,
    protocol_id: ProtocolId,
    proposals: &[message::Proposal],
) -> Option<NegotiatedSa> {
    proposals
        .iter()
        .find(|prop| prop.protocol_id == protocol_id && local.within(&prop.transforms))
        .map(|prop| NegotiatedSa {
            proposal_number: prop.number,
            remote_spi: prop.spi.clone(),
        })
}

// Key material lengths an ESP suite draws per direction, encryption key
// (with the AEAD salt where applicable) and integrity key.
pub fn esp_keymat_lengths(transforms: &Transforms) -> Result<(usize, usize), InitError> {
    let encr = transforms
        .get_type(TransformType::TYPE_ENCR)
        .ok_or("ESP suite has no encryption transform")?;
    let key_length = encr
        .key_length
        .ok_or("ESP encryption transform has no key length")? as usize
        / 8;
    let encr_length = match encr.transform_type {
        TransformType::ENCR_AES_GCM_16 | TransformType::ENCR_CHACHA20_POLY1305 => {
            key_length + AEAD_SALT_LENGTH
        }
        TransformType::ENCR_AES_CBC => key_length,
        _ => return Err("Unsupported ESP encryption transform".into()),
    };
    let integ_length = match transforms.get_type(TransformType::TYPE_INTEG) {
        Some(tr) if tr.transform_type == TransformType::AUTH_HMAC_SHA2_256_128 => 32,
        Some(_) => return Err("Unsupported ESP integrity transform".into()),
        None => 0,
    };
    Ok((encr_length, integ_length))
}

// A validated IKE suite with the lengths the key derivation needs.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CipherSuite {
    encr: TransformType,
    encr_key_length: usize,
    prf: TransformType,
    integ: Option<TransformType>,
    dh: TransformType,
}

impl CipherSuite {
    pub fn new(transforms: &Transforms) -> Result<CipherSuite, InitError> {
        let encr = transforms
            .get_type(TransformType::TYPE_ENCR)
            .ok_or("Suite has no encryption transform")?;
        let encr_key_length = match encr.key_length {
            Some(bits) => bits as usize / 8,
            None => return Err("Encryption transform has no key length".into()),
        };
        match encr.transform_type {
            TransformType::ENCR_AES_CBC
            | TransformType::ENCR_AES_GCM_16
            | TransformType::ENCR_CHACHA20_POLY1305 => {}
            _ => return Err("Unsupported encryption transform".into()),
        }
        if !matches!(encr_key_length, 16 | 32) {
            return Err("Unsupported encryption key length".into());
        }
        let prf = transforms
            .get_type(TransformType::TYPE_PRF)
            .ok_or("Suite has no PRF transform")?
            .transform_type;
        match prf {
            TransformType::PRF_HMAC_SHA2_256 | TransformType::PRF_HMAC_SHA2_384 => {}
            _ => return Err("Unsupported PRF transform".into()),
        }
        let integ = match transforms.get_type(TransformType::TYPE_INTEG) {
            Some(tr) => match tr.transform_type {
                TransformType::AUTH_HMAC_SHA2_256_128 => Some(tr.transform_type),
                _ => return Err("Unsupported integrity transform".into()),
            },
            None => None,
        };
        if encr.transform_type == TransformType::ENCR_AES_CBC && integ.is_none() {
            return Err("CBC encryption requires an integrity transform".into());
        }
        let dh = transforms
            .get_type(TransformType::TYPE_DH)
            .ok_or("Suite has no DH transform")?
            .transform_type;
        match dh {
            TransformType::DH_2048_MODP
            | TransformType::DH_256_ECP
            | TransformType::DH_384_ECP
            | TransformType::DH_CURVE25519 => {}
            _ => return Err("Unsupported DH transform".into()),
        }
        Ok(CipherSuite {
            encr: encr.transform_type,
            encr_key_length,
            prf,
            integ,
            dh,
        })
    }

    pub fn prf_length(&self) -> usize {
        match self.prf {
            TransformType::PRF_HMAC_SHA2_384 => 48,
            _ => 32,
        }
    }

    // Nonces match the PRF output, and are never shorter than 128 bits.
    pub fn nonce_length(&self) -> usize {
        self.prf_length().max(16)
    }

    pub fn integ_key_length(&self) -> usize {
        match self.integ {
            Some(TransformType::AUTH_HMAC_SHA2_256_128) => 32,
            _ => 0,
        }
    }

    pub fn integ_signature_length(&self) -> usize {
        match self.integ {
            Some(TransformType::AUTH_HMAC_SHA2_256_128) => 16,
            _ => 0,
        }
    }

    // Key material drawn for one encryption key, including the implicit salt
    // AEAD ciphers consume.
    pub fn encr_keymat_length(&self) -> usize {
        match self.encr {
            TransformType::ENCR_AES_GCM_16 | TransformType::ENCR_CHACHA20_POLY1305 => {
                self.encr_key_length + AEAD_SALT_LENGTH
            }
            _ => self.encr_key_length,
        }
    }

    pub fn is_aead(&self) -> bool {
        self.integ.is_none()
    }

    pub fn dh_group(&self) -> u16 {
        self.dh.type_id().1
    }

    pub fn create_prf(&self, key: &[u8]) -> Result<Prf, InitError> {
        Prf::init(self.prf, key)
    }

    pub fn create_dh(&self) -> Result<DhTransform, InitError> {
        DhTransform::init(self.dh)
    }

    pub fn create_integ(&self, key: &[u8]) -> Result<Option<Integ>, InitError> {
        match self.integ {
            Some(transform_type) => Ok(Some(Integ::init(transform_type, key)?)),
            None => Ok(None),
        }
    }

    pub fn create_cipher(&self, keymat: &[u8]) -> Result<Cipher, InitError> {
        Cipher::init(self.encr, keymat)
    }
}

pub enum DhTransform {
    Modp2048 {
        private_key: U2048,
        public_key: U2048,
    },
    Ecp256 {
        private_key: p256::NonZeroScalar,
        public_key: p256::PublicKey,
    },
    Ecp384 {
        private_key: p384::NonZeroScalar,
        public_key: p384::PublicKey,
    },
    Curve25519 {
        private_key: x25519_dalek::StaticSecret,
        public_key: x25519_dalek::PublicKey,
    },
}

impl DhTransform {
    pub fn init(transform_type: TransformType) -> Result<DhTransform, InitError> {
        match transform_type {
            TransformType::DH_2048_MODP => {
                let private_key = U2048::random(&mut OsRng);
                // DH_MODP_GENERATOR_2048^private_key mod DhModulus2048.
                let public_key = DH_MODP_RESIDUE_2048.pow(&private_key).retrieve();
                Ok(DhTransform::Modp2048 {
                    private_key,
                    public_key,
                })
            }
            TransformType::DH_256_ECP => {
                let private_key = p256::NonZeroScalar::random(&mut OsRng);
                let public_key = p256::PublicKey::from_secret_scalar(&private_key);
                Ok(DhTransform::Ecp256 {
                    private_key,
                    public_key,
                })
            }
            TransformType::DH_384_ECP => {
                let private_key = p384::NonZeroScalar::random(&mut OsRng);
                let public_key = p384::PublicKey::from_secret_scalar(&private_key);
                Ok(DhTransform::Ecp384 {
                    private_key,
                    public_key,
                })
            }
            TransformType::DH_CURVE25519 => {
                let private_key = x25519_dalek::StaticSecret::random_from_rng(OsRng);
                let public_key = x25519_dalek::PublicKey::from(&private_key);
                Ok(DhTransform::Curve25519 {
                    private_key,
                    public_key,
                })
            }
            _ => Err("Unsupported DH group".into()),
        }
    }

    pub fn group_number(&self) -> u16 {
        match self {
            Self::Modp2048 { .. } => TransformType::DH_2048_MODP.type_id().1,
            Self::Ecp256 { .. } => TransformType::DH_256_ECP.type_id().1,
            Self::Ecp384 { .. } => TransformType::DH_384_ECP.type_id().1,
            Self::Curve25519 { .. } => TransformType::DH_CURVE25519.type_id().1,
        }
    }

    pub fn public_key(&self) -> Vec<u8> {
        match self {
            Self::Modp2048 { public_key, .. } => public_key.to_be_bytes().to_vec(),
            Self::Ecp256 { public_key, .. } => {
                p256::EncodedPoint::from(public_key).as_bytes()[1..].to_vec()
            }
            Self::Ecp384 { public_key, .. } => {
                p384::EncodedPoint::from(public_key).as_bytes()[1..].to_vec()
            }
            Self::Curve25519 { public_key, .. } => public_key.as_bytes().to_vec(),
        }
    }

    // The shared secret is a fixed-width big-endian value, leading zeros
    // preserved (group-dependent length).
    pub fn compute_shared_secret(&self, peer_public_key: &[u8]) -> Result<Vec<u8>, InitError> {
        match self {
            Self::Modp2048 { private_key, .. } => {
                if peer_public_key.len() != 2048 / 8 {
                    return Err("MODP 2048 peer public key length is not valid".into());
                }
                let peer_public_key = U2048::from_be_slice(peer_public_key);
                let peer_residue = const_residue!(peer_public_key, DhModulus2048);
                let shared_key = peer_residue.pow(private_key).retrieve();
                Ok(shared_key.to_be_bytes().to_vec())
            }
            Self::Ecp256 { private_key, .. } => {
                if peer_public_key.len() != 64 {
                    return Err("ECP 256 peer public key length is not valid".into());
                }
                let mut sec1 = [0u8; 1 + 64];
                sec1[0] = Sec1Tag::Uncompressed.into();
                sec1[1..].copy_from_slice(peer_public_key);
                let peer_key = p256::PublicKey::from_sec1_bytes(&sec1).map_err(|err| {
                    debug!("Failed to decode ECP 256 peer public key: {}", err);
                    InitError::new("Failed to decode ECP 256 peer public key")
                })?;
                let public_point = p256::ProjectivePoint::from(peer_key.as_affine());
                let secret_point = (public_point * private_key.as_ref()).to_affine();
                Ok(p256::EncodedPoint::from(secret_point).compress().as_bytes()[1..].to_vec())
            }
            Self::Ecp384 { private_key, .. } => {
                if peer_public_key.len() != 96 {
                    return Err("ECP 384 peer public key length is not valid".into());
                }
                let mut sec1 = [0u8; 1 + 96];
                sec1[0] = Sec1Tag::Uncompressed.into();
                sec1[1..].copy_from_slice(peer_public_key);
                let peer_key = p384::PublicKey::from_sec1_bytes(&sec1).map_err(|err| {
                    debug!("Failed to decode ECP 384 peer public key: {}", err);
                    InitError::new("Failed to decode ECP 384 peer public key")
                })?;
                let public_point = p384::ProjectivePoint::from(peer_key.as_affine());
                let secret_point = (public_point * private_key.as_ref()).to_affine();
                Ok(p384::EncodedPoint::from(secret_point).compress().as_bytes()[1..].to_vec())
            }
            Self::Curve25519 { private_key, .. } => {
                if peer_public_key.len() != 32 {
                    return Err("Curve25519 peer public key length is not valid".into());
                }
                let mut peer_key = [0u8; 32];
                peer_key.copy_from_slice(peer_public_key);
                let peer_key = x25519_dalek::PublicKey::from(peer_key);
                let shared = private_key.diffie_hellman(&peer_key);
                Ok(shared.as_bytes().to_vec())
            }
        }
    }
}

#[derive(Clone)]
pub enum Prf {
    HmacSha256(HmacSha256),
    HmacSha384(HmacSha384),
}

impl Prf {
    fn init(transform_type: TransformType, key: &[u8]) -> Result<Prf, InitError> {
        match transform_type {
            TransformType::PRF_HMAC_SHA2_256 => {
                let hmac = <HmacSha256 as hmac::digest::KeyInit>::new_from_slice(key)
                    .map_err(|_| InitError::new("Failed to init HMAC SHA256 PRF"))?;
                Ok(Self::HmacSha256(hmac))
            }
            TransformType::PRF_HMAC_SHA2_384 => {
                let hmac = <HmacSha384 as hmac::digest::KeyInit>::new_from_slice(key)
                    .map_err(|_| InitError::new("Failed to init HMAC SHA384 PRF"))?;
                Ok(Self::HmacSha384(hmac))
            }
            _ => Err("Unsupported PRF".into()),
        }
    }

    pub fn output_length(&self) -> usize {
        match self {
            Self::HmacSha256(_) => 32,
            Self::HmacSha384(_) => 48,
        }
    }

    pub fn prf(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::HmacSha256(hmac) => {
                let mut hmac = hmac.clone();
                hmac.update(data);
                hmac.finalize().into_bytes().to_vec()
            }
            Self::HmacSha384(hmac) => {
                let mut hmac = hmac.clone();
                hmac.update(data);
                hmac.finalize().into_bytes().to_vec()
            }
        }
    }

    // prf+ keystream from RFC 7296, Section 2.13:
    // T1 = prf(K, S | 0x01), Tn = prf(K, Tn-1 | S | n).
    pub fn prf_plus(&self, seed: &[u8], length: usize) -> Vec<u8> {
        let mut keys = Vec::with_capacity(length);
        let mut last = vec![];
        for t in 1u8..=255 {
            let mut data = Vec::with_capacity(last.len() + seed.len() + 1);
            data.extend_from_slice(&last);
            data.extend_from_slice(seed);
            data.push(t);
            last = self.prf(&data);
            keys.extend_from_slice(&last);
            if keys.len() >= length {
                break;
            }
        }
        keys.truncate(length);
        keys
    }
}

pub enum Integ {
    HmacSha256tr128(HmacSha256),
}

impl Integ {
    fn init(transform_type: TransformType, key: &[u8]) -> Result<Integ, InitError> {
        match transform_type {
            TransformType::AUTH_HMAC_SHA2_256_128 => {
                let hmac = <HmacSha256 as hmac::digest::KeyInit>::new_from_slice(key)
                    .map_err(|_| InitError::new("Failed to init SHA256-128 HMAC key"))?;
                Ok(Self::HmacSha256tr128(hmac))
            }
            _ => Err("Unsupported integrity transform".into()),
        }
    }

    pub fn signature_length(&self) -> usize {
        match self {
            Self::HmacSha256tr128(_) => 16,
        }
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::HmacSha256tr128(hmac) => {
                let mut hmac = hmac.clone();
                hmac.update(data);
                let hash = hmac.finalize().into_bytes();
                hash[..self.signature_length()].to_vec()
            }
        }
    }

    pub fn validate(&self, data: &[u8], signature: &[u8]) -> bool {
        self.sign(data) == signature
    }
}

pub enum Cipher {
    AesCbc128(Aes128),
    AesCbc256(Aes256),
    AesGcm128 { cipher: Aes128Gcm, salt: [u8; 4] },
    AesGcm256 { cipher: Aes256Gcm, salt: [u8; 4] },
    ChaCha20Poly1305 { cipher: ChaCha20Poly1305, salt: [u8; 4] },
}

impl Cipher {
    fn init(transform_type: TransformType, keymat: &[u8]) -> Result<Cipher, InitError> {
        match transform_type {
            TransformType::ENCR_AES_CBC => match keymat.len() {
                16 => {
                    let cipher = cipher::KeyInit::new_from_slice(keymat)
                        .map_err(|_| InitError::new("Failed to init AES CBC 128 cipher"))?;
                    Ok(Self::AesCbc128(cipher))
                }
                32 => {
                    let cipher = cipher::KeyInit::new_from_slice(keymat)
                        .map_err(|_| InitError::new("Failed to init AES CBC 256 cipher"))?;
                    Ok(Self::AesCbc256(cipher))
                }
                _ => Err("Unsupported AES CBC key length".into()),
            },
            TransformType::ENCR_AES_GCM_16 => {
                if keymat.len() < AEAD_SALT_LENGTH {
                    return Err("AES GCM key material is too short".into());
                }
                let (key, salt_bytes) = keymat.split_at(keymat.len() - AEAD_SALT_LENGTH);
                let mut salt = [0u8; 4];
                salt.copy_from_slice(salt_bytes);
                match key.len() {
                    16 => {
                        let cipher = Aes128Gcm::new_from_slice(key)
                            .map_err(|_| InitError::new("Failed to init AES GCM 128 cipher"))?;
                        Ok(Self::AesGcm128 { cipher, salt })
                    }
                    32 => {
                        let cipher = Aes256Gcm::new_from_slice(key)
                            .map_err(|_| InitError::new("Failed to init AES GCM 256 cipher"))?;
                        Ok(Self::AesGcm256 { cipher, salt })
                    }
                    _ => Err("Unsupported AES GCM key length".into()),
                }
            }
            TransformType::ENCR_CHACHA20_POLY1305 => {
                if keymat.len() != 32 + AEAD_SALT_LENGTH {
                    return Err("ChaCha20-Poly1305 key material length is not valid".into());
                }
                let (key, salt_bytes) = keymat.split_at(32);
                let mut salt = [0u8; 4];
                salt.copy_from_slice(salt_bytes);
                let cipher = ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| InitError::new("Failed to init ChaCha20-Poly1305 cipher"))?;
                Ok(Self::ChaCha20Poly1305 { cipher, salt })
            }
            _ => Err("Unsupported encryption transform".into()),
        }
    }

    pub fn is_aead(&self) -> bool {
        !matches!(self, Self::AesCbc128(_) | Self::AesCbc256(_))
    }

    // Length of the sealed form, excluding any trailing ICV.
    pub fn sealed_length(&self, plaintext_length: usize) -> usize {
        match self {
            Self::AesCbc128(_) | Self::AesCbc256(_) => {
                let block_size = Aes256::block_size();
                let iv_size = CbcEncryptor::<Aes256>::iv_size();
                iv_size + (plaintext_length / block_size + 1) * block_size
            }
            _ => AEAD_IV_LENGTH + plaintext_length + 1 + AEAD_TAG_LENGTH,
        }
    }

    // Seals plaintext into IV | ciphertext of (plaintext | pad | pad length)
    // with the AEAD tag appended when applicable.
    pub fn seal(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::AesCbc128(cipher) => seal_cbc::<Aes128>(cipher.clone(), plaintext),
            Self::AesCbc256(cipher) => seal_cbc::<Aes256>(cipher.clone(), plaintext),
            Self::AesGcm128 { cipher, salt } => {
                seal_aead(cipher, salt, plaintext, associated_data)
            }
            Self::AesGcm256 { cipher, salt } => {
                seal_aead(cipher, salt, plaintext, associated_data)
            }
            Self::ChaCha20Poly1305 { cipher, salt } => {
                seal_aead(cipher, salt, plaintext, associated_data)
            }
        }
    }

    // Opens IV | ciphertext (| tag) back into the plaintext, stripping padding.
    pub fn open(&self, data: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let padded = match self {
            Self::AesCbc128(cipher) => open_cbc::<Aes128>(cipher.clone(), data)?,
            Self::AesCbc256(cipher) => open_cbc::<Aes256>(cipher.clone(), data)?,
            Self::AesGcm128 { cipher, salt } => open_aead(cipher, salt, data, associated_data)?,
            Self::AesGcm256 { cipher, salt } => open_aead(cipher, salt, data, associated_data)?,
            Self::ChaCha20Poly1305 { cipher, salt } => {
                open_aead(cipher, salt, data, associated_data)?
            }
        };
        if padded.is_empty() {
            return Err("Decrypted data is empty".into());
        }
        let pad_length = padded[padded.len() - 1] as usize + 1;
        if padded.len() < pad_length {
            return Err("Decrypted data has invalid padding".into());
        }
        Ok(padded[..padded.len() - pad_length].to_vec())
    }
}

type CbcEncryptor<C> = cbc::Encryptor<C>;
type CbcDecryptor<C> = cbc::Decryptor<C>;

fn seal_cbc<C>(cipher: C, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: BlockSizeUser + cipher::BlockCipher + cipher::BlockEncrypt + cipher::BlockDecrypt + Clone,
{
    let iv_size = CbcEncryptor::<C>::iv_size();
    let block_size = C::block_size();
    let padded_length = (plaintext.len() / block_size + 1) * block_size;
    let mut data = vec![0u8; iv_size + padded_length];
    let mut iv = Iv::<CbcEncryptor<C>>::default();
    rand::thread_rng()
        .try_fill(iv.as_mut_slice())
        .map_err(|err| {
            debug!("Failed to generate IV for AES CBC: {}", err);
            CryptoError::from("Failed to generate IV for AES CBC")
        })?;
    data[..iv_size].copy_from_slice(iv.as_slice());
    data[iv_size..iv_size + plaintext.len()].copy_from_slice(plaintext);
    data[iv_size + padded_length - 1] = (padded_length - plaintext.len() - 1) as u8;
    let encryptor = CbcEncryptor::<C>::inner_iv_init(cipher, &iv);
    encryptor
        .encrypt_padded_mut::<block_padding::NoPadding>(&mut data[iv_size..], padded_length)
        .map_err(|err| {
            debug!("Failed to encrypt AES CBC message: {}", err);
            CryptoError::from("Failed to encrypt AES CBC message")
        })?;
    Ok(data)
}

fn open_cbc<C>(cipher: C, data: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: BlockSizeUser + cipher::BlockCipher + cipher::BlockEncrypt + cipher::BlockDecrypt + Clone,
{
    let iv_size = CbcDecryptor::<C>::iv_size();
    let block_size = C::block_size();
    if data.len() <= iv_size || (data.len() - iv_size) % block_size != 0 {
        return Err("Encrypted data length is not valid".into());
    }
    let decryptor = CbcDecryptor::<C>::inner_iv_slice_init(cipher, &data[..iv_size])
        .map_err(|err| {
            debug!("Failed to init AES CBC IV: {}", err);
            CryptoError::from("Failed to init AES CBC IV")
        })?;
    let mut buffer = data[iv_size..].to_vec();
    decryptor
        .decrypt_padded_mut::<block_padding::NoPadding>(&mut buffer)
        .map_err(|err| {
            debug!("Failed to decrypt AES CBC message: {}", err);
            CryptoError::from("Failed to decrypt AES CBC message")
        })?;
    Ok(buffer)
}

fn seal_aead<A>(
    cipher: &A,
    salt: &[u8; 4],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError>
where
    A: AeadInPlace,
{
    let mut nonce = [0u8; AEAD_SALT_LENGTH + AEAD_IV_LENGTH];
    nonce[..AEAD_SALT_LENGTH].copy_from_slice(salt);
    rand::thread_rng()
        .try_fill(&mut nonce[AEAD_SALT_LENGTH..])
        .map_err(|err| {
            debug!("Failed to generate AEAD nonce: {}", err);
            CryptoError::from("Failed to generate AEAD nonce")
        })?;
    let mut data = Vec::with_capacity(AEAD_IV_LENGTH + plaintext.len() + 1 + AEAD_TAG_LENGTH);
    data.extend_from_slice(&nonce[AEAD_SALT_LENGTH..]);
    data.extend_from_slice(plaintext);
    // AEAD suites carry no padding beyond the pad length octet.
    data.push(0);
    let tag = cipher
        .encrypt_in_place_detached(
            nonce.as_slice().into(),
            associated_data,
            &mut data[AEAD_IV_LENGTH..],
        )
        .map_err(|err| {
            debug!("Failed to encrypt AEAD message: {}", err);
            CryptoError::from("Failed to encrypt AEAD message")
        })?;
    data.extend_from_slice(&tag);
    Ok(data)
}

fn open_aead<A>(
    cipher: &A,
    salt: &[u8; 4],
    data: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError>
where
    A: AeadInPlace,
{
    if data.len() < AEAD_IV_LENGTH + AEAD_TAG_LENGTH {
        return Err("Encrypted data length is not valid".into());
    }
    let mut nonce = [0u8; AEAD_SALT_LENGTH + AEAD_IV_LENGTH];
    nonce[..AEAD_SALT_LENGTH].copy_from_slice(salt);
    nonce[AEAD_SALT_LENGTH..].copy_from_slice(&data[..AEAD_IV_LENGTH]);
    let tag_offset = data.len() - AEAD_TAG_LENGTH;
    let mut buffer = data[AEAD_IV_LENGTH..tag_offset].to_vec();
    cipher
        .decrypt_in_place_detached(
            nonce.as_slice().into(),
            associated_data,
            &mut buffer,
            data[tag_offset..].into(),
        )
        .map_err(|err| {
            debug!("Failed to decrypt AEAD message: {}", err);
            CryptoError::from("Failed to decrypt AEAD message")
        })?;
    Ok(buffer)
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut hmac =
        <HmacSha256 as hmac::digest::KeyInit>::new_from_slice(key).expect("HMAC SHA256 accepts keys of any length");
    hmac.update(data);
    hmac.finalize().into_bytes().to_vec()
}

pub struct InitError {
    msg: &'static str,
}

impl InitError {
    fn new(msg: &'static str) -> InitError {
        InitError { msg }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl fmt::Debug for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for InitError {}

impl From<&'static str> for InitError {
    fn from(msg: &'static str) -> InitError {
        InitError { msg }
    }
}

pub struct CryptoError {
    msg: &'static str,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl fmt::Debug for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for CryptoError {}

impl From<&'static str> for CryptoError {
    fn from(msg: &'static str) -> CryptoError {
        CryptoError { msg }
    }
}

const DH_MODP_GENERATOR_2048: U2048 = U2048::from_u8(2);
const DH_MODP_RESIDUE_2048: constant_mod::Residue<DhModulus2048, { U2048::LIMBS }> =
    const_residue!(DH_MODP_GENERATOR_2048, DhModulus2048);

impl_modulus!(
    DhModulus2048,
    U2048,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF"
);

#[cfg(test)]
mod tests {
    use super::*;

    fn suite(transforms: &Transforms) -> CipherSuite {
        CipherSuite::new(transforms).expect("valid suite")
    }

    #[test]
    fn negotiation_accepts_superset_proposal() {
        let local = default_ike_transforms();
        let mut transforms = local.entries().to_vec();
        transforms.push(SaTransform::new(TransformType::DH_2048_MODP));
        let proposals = vec![message::Proposal {
            number: 1,
            protocol_id: ProtocolId::IKE,
            spi: vec![],
            transforms,
        }];
        let negotiated = negotiate(&local, ProtocolId::IKE, &proposals).expect("negotiated");
        assert_eq!(negotiated.proposal_number, 1);
        assert!(negotiated.remote_spi.is_empty());
    }

    #[test]
    fn negotiation_rejects_mismatched_proposal() {
        let local = default_ike_transforms();
        let other = Transforms::ike(
            TransformType::ENCR_AES_CBC,
            256,
            Some(TransformType::AUTH_HMAC_SHA2_256_128),
            TransformType::PRF_HMAC_SHA2_256,
            TransformType::DH_2048_MODP,
        );
        let proposals = vec![other.to_proposal(ProtocolId::IKE, &[])];
        assert!(negotiate(&local, ProtocolId::IKE, &proposals).is_none());
    }

    #[test]
    fn negotiation_skips_wrong_protocol() {
        let local = default_esp_transforms();
        let proposals = vec![local.to_proposal(ProtocolId::IKE, &[])];
        assert!(negotiate(&local, ProtocolId::ESP, &proposals).is_none());
    }

    #[test]
    fn suite_lengths_match_transforms() {
        let cbc = suite(&Transforms::ike(
            TransformType::ENCR_AES_CBC,
            256,
            Some(TransformType::AUTH_HMAC_SHA2_256_128),
            TransformType::PRF_HMAC_SHA2_256,
            TransformType::DH_2048_MODP,
        ));
        assert_eq!(cbc.prf_length(), 32);
        assert_eq!(cbc.integ_key_length(), 32);
        assert_eq!(cbc.encr_keymat_length(), 32);
        assert!(!cbc.is_aead());

        let chacha = suite(&default_ike_transforms());
        assert_eq!(chacha.encr_keymat_length(), 36);
        assert_eq!(chacha.integ_key_length(), 0);
        assert!(chacha.is_aead());
        assert_eq!(chacha.nonce_length(), 32);
    }

    #[test]
    fn dh_groups_agree_on_shared_secret() {
        for dh in [
            TransformType::DH_2048_MODP,
            TransformType::DH_256_ECP,
            TransformType::DH_384_ECP,
            TransformType::DH_CURVE25519,
        ] {
            let a = DhTransform::init(dh).expect("DH init");
            let b = DhTransform::init(dh).expect("DH init");
            let shared_a = a
                .compute_shared_secret(&b.public_key())
                .expect("shared secret");
            let shared_b = b
                .compute_shared_secret(&a.public_key())
                .expect("shared secret");
            assert_eq!(shared_a, shared_b, "group {}", a.group_number());
        }
    }

    #[test]
    fn dh_public_key_lengths() {
        let modp = DhTransform::init(TransformType::DH_2048_MODP).expect("DH init");
        assert_eq!(modp.public_key().len(), 256);
        let ecp = DhTransform::init(TransformType::DH_256_ECP).expect("DH init");
        assert_eq!(ecp.public_key().len(), 64);
        let x = DhTransform::init(TransformType::DH_CURVE25519).expect("DH init");
        assert_eq!(x.public_key().len(), 32);
    }

    #[test]
    fn prf_plus_is_deterministic_and_sized() {
        let prf = Prf::init(TransformType::PRF_HMAC_SHA2_256, b"test key").expect("PRF init");
        let first = prf.prf_plus(b"seed", 100);
        let second = prf.prf_plus(b"seed", 100);
        assert_eq!(first, second);
        assert_eq!(first.len(), 100);
        // A longer request extends, never rewrites, the prefix.
        let longer = prf.prf_plus(b"seed", 200);
        assert_eq!(&longer[..100], first.as_slice());
    }

    #[test]
    fn cipher_seal_open_round_trip() {
        let plaintext = b"a fairly short IKE payload chain";
        let aad = b"associated data";
        for (encr, keymat_len) in [
            (TransformType::ENCR_AES_CBC, 32),
            (TransformType::ENCR_AES_GCM_16, 20),
            (TransformType::ENCR_AES_GCM_16, 36),
            (TransformType::ENCR_CHACHA20_POLY1305, 36),
        ] {
            let keymat = vec![0x42u8; keymat_len];
            let cipher = Cipher::init(encr, &keymat).expect("cipher init");
            let sealed = cipher.seal(plaintext, aad).expect("seal");
            let opened = cipher.open(&sealed, aad).expect("open");
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn aead_open_rejects_tampered_data() {
        let keymat = vec![0x42u8; 36];
        let cipher =
            Cipher::init(TransformType::ENCR_CHACHA20_POLY1305, &keymat).expect("cipher init");
        let mut sealed = cipher.seal(b"payload", b"aad").expect("seal");
        let tampered = sealed.len() - 1;
        sealed[tampered] ^= 0xff;
        assert!(cipher.open(&sealed, b"aad").is_err());
        let sealed = cipher.seal(b"payload", b"aad").expect("seal");
        assert!(cipher.open(&sealed, b"other aad").is_err());
    }
}
