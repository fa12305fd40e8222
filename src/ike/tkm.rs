use log::debug;
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

use super::crypto::{
    Cipher, CipherSuite, CryptoError, DhTransform, InitError, Prf, Transforms,
};
use super::message::{self, IkeHeader, PayloadType, Payloads, IKE_HEADER_LEN};

const PSK_KEY_PAD: &[u8] = b"Key Pad for IKEv2";

// Transform Key Manager: owns the DH agreement, nonces and every key derived
// for one IKE SA. Keys exist only after a successful DH and nonce exchange.
pub struct Tkm {
    is_initiator: bool,
    suite: CipherSuite,
    dh: Option<DhTransform>,
    ni: Vec<u8>,
    nr: Vec<u8>,
    shared_secret: Option<Vec<u8>>,
    skeyseed: Vec<u8>,
    keys: Option<SessionKeys>,
    crypt: Option<CryptoStack>,
}

struct SessionKeys {
    sk_d: Vec<u8>,
    sk_pi: Vec<u8>,
    sk_pr: Vec<u8>,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.sk_d.zeroize();
        self.sk_pi.zeroize();
        self.sk_pr.zeroize();
    }
}

struct CryptoStack {
    cipher_initiator: Cipher,
    cipher_responder: Cipher,
    integ_initiator: Option<super::crypto::Integ>,
    integ_responder: Option<super::crypto::Integ>,
    prf_initiator: Prf,
    prf_responder: Prf,
}

pub struct ChildSaKeys {
    pub encr_initiator: Vec<u8>,
    pub integ_initiator: Vec<u8>,
    pub encr_responder: Vec<u8>,
    pub integ_responder: Vec<u8>,
}

impl Tkm {
    pub fn new_initiator(transforms: &Transforms) -> Result<Tkm, InitError> {
        let suite = CipherSuite::new(transforms)?;
        let dh = suite.create_dh()?;
        let ni = create_nonce(suite.nonce_length());
        Ok(Tkm {
            is_initiator: true,
            suite,
            dh: Some(dh),
            ni,
            nr: vec![],
            shared_secret: None,
            skeyseed: vec![],
            keys: None,
            crypt: None,
        })
    }

    pub fn new_responder(transforms: &Transforms) -> Result<Tkm, InitError> {
        let suite = CipherSuite::new(transforms)?;
        let dh = suite.create_dh()?;
        let nr = create_nonce(suite.nonce_length());
        Ok(Tkm {
            is_initiator: false,
            suite,
            dh: Some(dh),
            ni: vec![],
            nr,
            shared_secret: None,
            skeyseed: vec![],
            keys: None,
            crypt: None,
        })
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn suite(&self) -> &CipherSuite {
        &self.suite
    }

    pub fn local_nonce(&self) -> &[u8] {
        if self.is_initiator {
            &self.ni
        } else {
            &self.nr
        }
    }

    pub fn set_peer_nonce(&mut self, nonce: &[u8]) {
        if self.is_initiator {
            self.nr = nonce.to_vec();
        } else {
            self.ni = nonce.to_vec();
        }
    }

    pub fn nonce_initiator(&self) -> &[u8] {
        &self.ni
    }

    pub fn dh_group(&self) -> u16 {
        self.suite.dh_group()
    }

    pub fn dh_public_key(&self) -> Result<Vec<u8>, InitError> {
        match self.dh.as_ref() {
            Some(dh) => Ok(dh.public_key()),
            None => Err("DH transform is not initialized".into()),
        }
    }

    pub fn compute_dh_shared(&mut self, peer_public_key: &[u8]) -> Result<(), InitError> {
        let dh = self
            .dh
            .as_ref()
            .ok_or("DH transform is not initialized")?;
        let shared = dh.compute_shared_secret(peer_public_key)?;
        self.shared_secret = Some(shared);
        Ok(())
    }

    pub fn has_keys(&self) -> bool {
        self.crypt.is_some()
    }

    // SKEYSEED and the seven-key expansion from RFC 7296, Section 2.14:
    // SKEYSEED = prf(Ni | Nr, g^ir),
    // {SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr}
    //   = prf+(SKEYSEED, Ni | Nr | SPIi | SPIr).
    // Returns the raw expansion, which known-answer tests compare.
    pub fn isa_create(&mut self, spi_i: &[u8], spi_r: &[u8]) -> Result<Vec<u8>, InitError> {
        let shared = self
            .shared_secret
            .as_ref()
            .ok_or("DH shared secret is not computed")?;
        if self.ni.is_empty() || self.nr.is_empty() {
            return Err("Nonce exchange is not complete".into());
        }
        let mut nonces = Vec::with_capacity(self.ni.len() + self.nr.len());
        nonces.extend_from_slice(&self.ni);
        nonces.extend_from_slice(&self.nr);
        let prf = self.suite.create_prf(&nonces)?;
        self.skeyseed = prf.prf(shared);

        let mut seed = nonces;
        seed.extend_from_slice(spi_i);
        seed.extend_from_slice(spi_r);
        let prf_len = self.suite.prf_length();
        let integ_len = self.suite.integ_key_length();
        let encr_len = self.suite.encr_keymat_length();
        let total = prf_len + 2 * integ_len + 2 * encr_len + 2 * prf_len;
        let prf = self.suite.create_prf(&self.skeyseed)?;
        let keymat = prf.prf_plus(&seed, total);

        let mut cursor = 0;
        let mut take = |len: usize| {
            let range = cursor..cursor + len;
            cursor = range.end;
            keymat[range].to_vec()
        };
        let sk_d = take(prf_len);
        let sk_ai = take(integ_len);
        let sk_ar = take(integ_len);
        let sk_ei = take(encr_len);
        let sk_er = take(encr_len);
        let sk_pi = take(prf_len);
        let sk_pr = take(prf_len);

        self.crypt = Some(CryptoStack {
            cipher_initiator: self.suite.create_cipher(&sk_ei)?,
            cipher_responder: self.suite.create_cipher(&sk_er)?,
            integ_initiator: self.suite.create_integ(&sk_ai)?,
            integ_responder: self.suite.create_integ(&sk_ar)?,
            prf_initiator: self.suite.create_prf(&sk_pi)?,
            prf_responder: self.suite.create_prf(&sk_pr)?,
        });
        self.keys = Some(SessionKeys { sk_d, sk_pi, sk_pr });
        Ok(keymat)
    }

    pub fn skeyseed(&self) -> &[u8] {
        &self.skeyseed
    }

    // KEYMAT = prf+(SK_d, Ni | Nr), partitioned with all keys for the
    // initiator-to-responder SA first, encryption before integrity.
    pub fn child_sa_keys(
        &self,
        encr_length: usize,
        integ_length: usize,
    ) -> Result<ChildSaKeys, InitError> {
        let keys = self.keys.as_ref().ok_or("Session keys are not derived")?;
        let prf = self.suite.create_prf(&keys.sk_d)?;
        let mut seed = Vec::with_capacity(self.ni.len() + self.nr.len());
        seed.extend_from_slice(&self.ni);
        seed.extend_from_slice(&self.nr);
        let keymat = prf.prf_plus(&seed, 2 * (encr_length + integ_length));
        let mut cursor = 0;
        let mut take = |len: usize| {
            let range = cursor..cursor + len;
            cursor = range.end;
            keymat[range].to_vec()
        };
        Ok(ChildSaKeys {
            encr_initiator: take(encr_length),
            integ_initiator: take(integ_length),
            encr_responder: take(encr_length),
            integ_responder: take(integ_length),
        })
    }

    // Signed octets for the AUTH payload: the raw INIT message of the signing
    // side, the peer's nonce and prf(SK_p, ID body).
    pub fn auth_octets(
        &self,
        for_initiator: bool,
        init_message: &[u8],
        id_body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let crypt = self
            .crypt
            .as_ref()
            .ok_or("Session keys are not derived")?;
        let (nonce, prf) = if for_initiator {
            (&self.nr, &crypt.prf_initiator)
        } else {
            (&self.ni, &crypt.prf_responder)
        };
        let mut octets =
            Vec::with_capacity(init_message.len() + nonce.len() + prf.output_length());
        octets.extend_from_slice(init_message);
        octets.extend_from_slice(nonce);
        octets.extend_from_slice(&prf.prf(id_body));
        Ok(octets)
    }

    // AUTH = prf(prf(psk, "Key Pad for IKEv2"), signed octets).
    pub fn psk_auth(&self, psk: &[u8], signed_octets: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let pad_key = self
            .suite
            .create_prf(psk)
            .map_err(|_| CryptoError::from("Failed to init PSK pad PRF"))?
            .prf(PSK_KEY_PAD);
        let prf = self
            .suite
            .create_prf(&pad_key)
            .map_err(|_| CryptoError::from("Failed to init PSK PRF"))?;
        Ok(prf.prf(signed_octets))
    }

    // Seals payloads into an SK envelope: IV | ciphertext | pad | pad length
    // | ICV, appended after the IKE header and the SK generic header. For AEAD
    // suites the associated data is the header plus the SK generic header.
    pub fn seal_message(
        &self,
        header: &mut IkeHeader,
        payloads: &Payloads,
    ) -> Result<Vec<u8>, CryptoError> {
        let crypt = self
            .crypt
            .as_ref()
            .ok_or("Session keys are not derived")?;
        let (cipher, integ) = if self.is_initiator {
            (&crypt.cipher_initiator, &crypt.integ_initiator)
        } else {
            (&crypt.cipher_responder, &crypt.integ_responder)
        };
        let plaintext = message::encode_payloads(payloads);
        let sealed_length = cipher.sealed_length(plaintext.len());
        let icv_length = integ.as_ref().map(|i| i.signature_length()).unwrap_or(0);
        let sk_length = 4 + sealed_length + icv_length;
        header.next_payload = PayloadType::ENCRYPTED_AND_AUTHENTICATED;
        header.length = (IKE_HEADER_LEN + sk_length) as u32;
        if header.length as usize > message::MAX_IKE_MESSAGE_LEN {
            return Err("Sealed message would exceed maximum length".into());
        }

        let mut b = Vec::with_capacity(header.length as usize);
        b.extend_from_slice(&header.encode());
        b.push(payloads.first_payload_type().type_id());
        b.push(0);
        b.extend_from_slice(&(sk_length as u16).to_be_bytes());
        let associated_data = if cipher.is_aead() { b.as_slice() } else { &[] };
        let sealed = cipher.seal(&plaintext, associated_data)?;
        b.extend_from_slice(&sealed);
        if let Some(integ) = integ {
            let icv = integ.sign(&b);
            b.extend_from_slice(&icv);
        }
        Ok(b)
    }

    // Opens the SK envelope of a received message. Integrity failures are
    // reported as errors; callers treat them as if the message never arrived.
    pub fn open_message(
        &self,
        raw: &[u8],
        msg: &message::Message,
    ) -> Result<Payloads, CryptoError> {
        let crypt = self
            .crypt
            .as_ref()
            .ok_or("Session keys are not derived")?;
        let (cipher, integ) = if self.is_initiator {
            (&crypt.cipher_responder, &crypt.integ_responder)
        } else {
            (&crypt.cipher_initiator, &crypt.integ_initiator)
        };
        let (first_payload, data) = msg
            .payloads
            .encrypted()
            .ok_or("Message has no SK payload")?;
        let raw = raw
            .get(..msg.header.length as usize)
            .ok_or("Datagram shorter than header length")?;
        let inner = if let Some(integ) = integ {
            let icv_length = integ.signature_length();
            if data.len() < icv_length || raw.len() < icv_length {
                return Err("SK payload is too short for ICV".into());
            }
            let boundary = raw.len() - icv_length;
            if !integ.validate(&raw[..boundary], &raw[boundary..]) {
                debug!("SK payload has invalid ICV");
                return Err("SK payload has invalid ICV".into());
            }
            cipher.open(&data[..data.len() - icv_length], &[])?
        } else {
            if raw.len() < IKE_HEADER_LEN + 4 {
                return Err("SK payload is too short".into());
            }
            let associated_data = &raw[..IKE_HEADER_LEN + 4];
            cipher.open(data, associated_data)?
        };
        message::decode_payloads(&inner, first_payload).map_err(|err| {
            debug!("Failed to parse decrypted payloads: {}", err);
            CryptoError::from("Failed to parse decrypted payloads")
        })
    }
}

// Nonce sized to the PRF output, never below 128 bits, from the OS CSPRNG.
fn create_nonce(length: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; length.max(16)];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::crypto;
    use super::super::message::TransformType;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).expect("valid hex"))
            .collect()
    }

    fn test_suite() -> CipherSuite {
        CipherSuite::new(&Transforms::ike(
            TransformType::ENCR_AES_CBC,
            256,
            Some(TransformType::AUTH_HMAC_SHA2_256_128),
            TransformType::PRF_HMAC_SHA2_256,
            TransformType::DH_2048_MODP,
        ))
        .expect("valid suite")
    }

    fn fixed_tkm(is_initiator: bool) -> Tkm {
        let nonce = hex("63a02b62475680de1c50af97a82a7abd8d464d9511f87ac86a3e1e4217405afa");
        let shared = hex(concat!(
            "327adb6c8f7185d4897b652861f5474f8e7be3882853093029d15747645cae97",
            "be69b476e0a11a12d03ea6d6ebabc51aedc7c66399b6c7d6a2e3da2b08783476",
            "2e0ca23ede6a9a0a6948e8291a13969c9be0961eff40c06700c279cb99983e1f",
            "22ddba4ead1c2cd180832b534e0bfe5a2a3d4210d721efb1868b555e1912e981",
            "33c0b690abfd16e0e5d01c99c73934c380aa7c2363179069d2c8abfc061a1107",
            "e9cfa40ce3735258fcf81456bff7edc2bd63b99e2c32ff6ec33f2552b80ce870",
            "f3d268d47c72ef61c8c9e8ebe975e7012f8b79a75b2ddf914048c69b169c2f67",
            "a816c276fb1dff11fcc63e883a51505baecfb581ab375534b52d43e441996089",
        ));
        Tkm {
            is_initiator,
            suite: test_suite(),
            dh: None,
            ni: nonce.clone(),
            nr: nonce,
            shared_secret: Some(shared),
            skeyseed: vec![],
            keys: None,
            crypt: None,
        }
    }

    // Known-answer vector for DH group 14 with Ni == Nr.
    #[test]
    fn skeyseed_and_keymat_match_reference_vector() {
        let mut tkm = fixed_tkm(false);
        let keymat = tkm
            .isa_create(&hex("928f3f581f05a563"), &[])
            .expect("key derivation");
        assert_eq!(
            tkm.skeyseed(),
            hex("ff7972ddae0b6d10ea4fd33418a489a4c92e8b053e25b4c9166b4b7a2aa29776").as_slice()
        );
        assert_eq!(
            keymat,
            hex(concat!(
                "dda4d24404d5e03911079e67e56b12e47523972bf0cc75df8e13e79ed23607d3",
                "dc28758b9ea4a67c9bcd6260cc83cc1baa77d4ff2fee910e36826c66b6af9d09",
                "1c54dc63e8318df0fde5e6acd7d175cf354d6b169217b662041f9b401751c7ce",
                "94c01e11830e9bbeb3b7c24ae58f79260b2220dfe4220dc64a79bb215a778734",
                "c9bbce70166a82422715e7b11620d92af5fdbbee31bebc90be909b08a5e810ad",
                "979a16584cd32c61682ccfb0d30822a60ccf1909994472f90a3b925c7bb4c166",
                "4abe17463a429fbb94bade006b05855011425e6155c87907b21560b99e962455",
            ))
        );
    }

    #[test]
    fn skeyseed_depends_only_on_nonces_and_shared_secret() {
        let mut first = fixed_tkm(false);
        first
            .isa_create(&hex("928f3f581f05a563"), &hex("0000000000000000"))
            .expect("key derivation");
        let mut second = fixed_tkm(true);
        second
            .isa_create(&hex("ffffffffffffffff"), &hex("0000000000000001"))
            .expect("key derivation");
        // Different SPIs change the expansion, never SKEYSEED.
        assert_eq!(first.skeyseed(), second.skeyseed());
    }

    #[test]
    fn keymat_lengths_follow_the_suite() {
        let mut tkm = fixed_tkm(false);
        let keymat = tkm.isa_create(&[0u8; 8], &[0u8; 8]).expect("key derivation");
        // SK_d + 2 * SK_a + 2 * SK_e + 2 * SK_p for the negotiated suite.
        assert_eq!(keymat.len(), 32 + 2 * 32 + 2 * 32 + 2 * 32);
    }

    #[test]
    fn child_sa_keys_split_keymat_in_order() {
        let mut tkm = fixed_tkm(false);
        tkm.isa_create(&[0u8; 8], &[0u8; 8]).expect("key derivation");
        let keys = tkm.child_sa_keys(36, 0).expect("child keys");
        assert_eq!(keys.encr_initiator.len(), 36);
        assert_eq!(keys.integ_initiator.len(), 0);
        assert_eq!(keys.encr_responder.len(), 36);
        assert_ne!(keys.encr_initiator, keys.encr_responder);
        // The split is a straight partition of prf+(SK_d, Ni | Nr).
        let keys2 = tkm.child_sa_keys(36, 0).expect("child keys");
        assert_eq!(keys.encr_initiator, keys2.encr_initiator);
    }

    #[test]
    fn psk_auth_is_deterministic_and_keyed() {
        let mut tkm = fixed_tkm(false);
        tkm.isa_create(&[1u8; 8], &[2u8; 8]).expect("key derivation");
        let octets = tkm
            .auth_octets(true, b"init message bytes", b"id body")
            .expect("auth octets");
        let auth = tkm.psk_auth(b"foo", &octets).expect("psk auth");
        assert_eq!(auth, tkm.psk_auth(b"foo", &octets).expect("psk auth"));
        assert_ne!(auth, tkm.psk_auth(b"bar", &octets).expect("psk auth"));
    }

    #[test]
    fn seal_and_open_round_trip_between_roles() {
        let transforms = crypto::default_ike_transforms();
        let mut initiator = Tkm::new_initiator(&transforms).expect("initiator TKM");
        let mut responder = Tkm::new_responder(&transforms).expect("responder TKM");
        responder.set_peer_nonce(initiator.local_nonce());
        initiator.set_peer_nonce(responder.local_nonce());
        let initiator_public = initiator.dh_public_key().expect("public key");
        let responder_public = responder.dh_public_key().expect("public key");
        initiator
            .compute_dh_shared(&responder_public)
            .expect("shared secret");
        responder
            .compute_dh_shared(&initiator_public)
            .expect("shared secret");
        let spi_i = [0x11u8; 8];
        let spi_r = [0x22u8; 8];
        initiator.isa_create(&spi_i, &spi_r).expect("initiator keys");
        responder.isa_create(&spi_i, &spi_r).expect("responder keys");

        let mut payloads = Payloads::new();
        payloads.push(message::Payload::Nonce(vec![0xaa; 32]));
        let mut header = IkeHeader::new(
            u64::from_be_bytes(spi_i),
            u64::from_be_bytes(spi_r),
            message::ExchangeType::IKE_AUTH,
            message::Flags::INITIATOR,
            1,
        );
        let sealed = initiator
            .seal_message(&mut header, &payloads)
            .expect("seal");
        let msg = message::Message::decode(&sealed).expect("decode sealed");
        let opened = responder.open_message(&sealed, &msg).expect("open");
        assert_eq!(opened, payloads);

        // Tampering with the sealed bytes must fail the open.
        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let msg = message::Message::decode(&tampered).expect("decode tampered");
        assert!(responder.open_message(&tampered, &msg).is_err());
    }
}
