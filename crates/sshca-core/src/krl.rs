//! OpenSSH Key Revocation List (KRL) encoding and membership checks.
//!
//! The layout follows `PROTOCOL.krl` from OpenSSH so the blob served at
//! `/revoked` can be dropped straight into `RevokedKeys` on a host:
//!
//! ```text
//! uint64 KRL_MAGIC (0x5353484b524c0a00)
//! uint32 KRL_FORMAT_VERSION (1)
//! uint64 krl_version
//! uint64 generated_date
//! uint64 flags
//! string reserved
//! string comment
//! [byte section_type, string section_data]*
//! [byte KRL_SECTION_SIGNATURE, string signature_key, string signature]*
//! ```
//!
//! Only certificate sections (serial list, serial range, serial bitmap and
//! key id subsections) and explicit key sections are understood. SHA1
//! fingerprint sections are rejected.

use std::collections::BTreeSet;

use signature::{Signer, Verifier};
use ssh_encoding::{Decode, Encode};
use ssh_key::public::KeyData;
use ssh_key::{Certificate, PrivateKey, Signature};
use tracing::debug;

use crate::error::{CaError, Result};

/// `"SSHKRL\n\0"` as a big-endian integer.
pub const KRL_MAGIC: u64 = 0x5353_484b_524c_0a00;

/// The only KRL format version defined by OpenSSH.
pub const KRL_FORMAT_VERSION: u32 = 1;

const SECTION_CERTIFICATES: u8 = 1;
const SECTION_EXPLICIT_KEY: u8 = 2;
const SECTION_FINGERPRINT_SHA1: u8 = 3;
const SECTION_SIGNATURE: u8 = 4;

const CERT_SERIAL_LIST: u8 = 0x20;
const CERT_SERIAL_RANGE: u8 = 0x21;
const CERT_SERIAL_BITMAP: u8 = 0x22;
const CERT_KEY_ID: u8 = 0x23;

/// Revocations scoped to a single CA key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateSection {
    /// Issuing CA. `None` matches certificates from any CA.
    pub ca_key: Option<KeyData>,
    pub serials: BTreeSet<u64>,
    pub serial_ranges: Vec<(u64, u64)>,
    /// `(serial_offset, big-endian bitmap)` pairs.
    pub serial_bitmaps: Vec<(u64, Vec<u8>)>,
    pub key_ids: BTreeSet<String>,
}

impl CertificateSection {
    fn new(ca_key: Option<KeyData>) -> Self {
        Self {
            ca_key,
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.serials.is_empty()
            && self.serial_ranges.is_empty()
            && self.serial_bitmaps.is_empty()
            && self.key_ids.is_empty()
    }

    fn covers_ca(&self, signature_key: &KeyData) -> bool {
        self.ca_key.as_ref().map_or(true, |ca| ca == signature_key)
    }

    fn covers_serial(&self, serial: u64) -> bool {
        self.serials.contains(&serial)
            || self
                .serial_ranges
                .iter()
                .any(|&(min, max)| (min..=max).contains(&serial))
            || self
                .serial_bitmaps
                .iter()
                .any(|(offset, bitmap)| bitmap_has(bitmap, *offset, serial))
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        match &self.ca_key {
            Some(ca) => key_blob(ca)?.encode(&mut body)?,
            None => [0u8; 0].as_slice().encode(&mut body)?,
        }
        // reserved
        [0u8; 0].as_slice().encode(&mut body)?;

        if !self.serials.is_empty() {
            let mut list = Vec::new();
            for serial in &self.serials {
                serial.encode(&mut list)?;
            }
            CERT_SERIAL_LIST.encode(&mut body)?;
            list.encode(&mut body)?;
        }
        for &(min, max) in &self.serial_ranges {
            let mut range = Vec::new();
            min.encode(&mut range)?;
            max.encode(&mut range)?;
            CERT_SERIAL_RANGE.encode(&mut body)?;
            range.encode(&mut body)?;
        }
        if !self.key_ids.is_empty() {
            let mut ids = Vec::new();
            for id in &self.key_ids {
                id.as_str().encode(&mut ids)?;
            }
            CERT_KEY_ID.encode(&mut body)?;
            ids.encode(&mut body)?;
        }
        Ok(body)
    }

    fn parse_body(mut body: &[u8]) -> Result<Self> {
        let ca_blob = Vec::<u8>::decode(&mut body)?;
        let ca_key = if ca_blob.is_empty() {
            None
        } else {
            Some(parse_key_blob(&ca_blob)?)
        };
        let _reserved = Vec::<u8>::decode(&mut body)?;

        let mut section = Self::new(ca_key);
        while !body.is_empty() {
            let kind = u8::decode(&mut body)?;
            let data = Vec::<u8>::decode(&mut body)?;
            let mut data = data.as_slice();
            match kind {
                CERT_SERIAL_LIST => {
                    while !data.is_empty() {
                        section.serials.insert(u64::decode(&mut data)?);
                    }
                }
                CERT_SERIAL_RANGE => {
                    let min = u64::decode(&mut data)?;
                    let max = u64::decode(&mut data)?;
                    if min > max {
                        return Err(CaError::Krl(format!("inverted serial range {min}..{max}")));
                    }
                    section.serial_ranges.push((min, max));
                }
                CERT_SERIAL_BITMAP => {
                    let offset = u64::decode(&mut data)?;
                    let bitmap = Vec::<u8>::decode(&mut data)?;
                    section.serial_bitmaps.push((offset, bitmap));
                }
                CERT_KEY_ID => {
                    while !data.is_empty() {
                        section.key_ids.insert(String::decode(&mut data)?);
                    }
                }
                other => {
                    return Err(CaError::Krl(format!(
                        "unknown certificate subsection 0x{other:02x}"
                    )))
                }
            }
        }
        Ok(section)
    }
}

/// An in-memory Key Revocation List.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Krl {
    /// Monotonic list version. Zero means "use the generation date".
    pub version: u64,
    pub generated_date: u64,
    pub comment: String,
    pub certificates: Vec<CertificateSection>,
    pub explicit_keys: Vec<KeyData>,
    signing_keys: Vec<KeyData>,
}

impl Krl {
    /// An empty KRL stamped with the current time.
    pub fn new() -> Self {
        Self {
            generated_date: now_unix(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Keys whose signatures were present when this KRL was parsed.
    pub fn signing_keys(&self) -> &[KeyData] {
        &self.signing_keys
    }

    /// Revoke certificates issued by `ca` carrying any of `key_ids`.
    pub fn revoke_key_ids<I, S>(&mut self, ca: &KeyData, key_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let section = self.cert_section_mut(ca);
        section.key_ids.extend(key_ids.into_iter().map(Into::into));
    }

    /// Revoke certificates issued by `ca` with any of `serials`.
    pub fn revoke_serials(&mut self, ca: &KeyData, serials: impl IntoIterator<Item = u64>) {
        self.cert_section_mut(ca).serials.extend(serials);
    }

    /// Revoke certificates issued by `ca` with serials in `min..=max`.
    pub fn revoke_serial_range(&mut self, ca: &KeyData, min: u64, max: u64) -> Result<()> {
        if min > max {
            return Err(CaError::Krl(format!("inverted serial range {min}..{max}")));
        }
        self.cert_section_mut(ca).serial_ranges.push((min, max));
        Ok(())
    }

    /// Revoke a plain public key (and any certificate for it).
    pub fn revoke_key(&mut self, key: &KeyData) {
        if !self.explicit_keys.contains(key) {
            self.explicit_keys.push(key.clone());
        }
    }

    fn cert_section_mut(&mut self, ca: &KeyData) -> &mut CertificateSection {
        let idx = match self
            .certificates
            .iter()
            .position(|c| c.ca_key.as_ref() == Some(ca))
        {
            Some(idx) => idx,
            None => {
                self.certificates
                    .push(CertificateSection::new(Some(ca.clone())));
                self.certificates.len() - 1
            }
        };
        &mut self.certificates[idx]
    }

    /// True if `cert` is revoked by any section of this list.
    pub fn is_revoked(&self, cert: &Certificate) -> bool {
        self.is_key_revoked(cert.public_key())
            || self.certificates.iter().any(|c| {
                c.covers_ca(cert.signature_key())
                    && (c.key_ids.contains(cert.key_id()) || c.covers_serial(cert.serial()))
            })
    }

    /// True if a plain key appears in an explicit key section.
    pub fn is_key_revoked(&self, key: &KeyData) -> bool {
        self.explicit_keys.contains(key)
    }

    /// Serialize to the binary KRL format, optionally signed by `signer`.
    pub fn encode(&self, signer: Option<&PrivateKey>) -> Result<Vec<u8>> {
        let version = if self.version == 0 {
            self.generated_date
        } else {
            self.version
        };

        let mut out = Vec::new();
        KRL_MAGIC.encode(&mut out)?;
        KRL_FORMAT_VERSION.encode(&mut out)?;
        version.encode(&mut out)?;
        self.generated_date.encode(&mut out)?;
        0u64.encode(&mut out)?; // flags
        [0u8; 0].as_slice().encode(&mut out)?; // reserved
        self.comment.as_str().encode(&mut out)?;

        for section in self.certificates.iter().filter(|c| !c.is_empty()) {
            SECTION_CERTIFICATES.encode(&mut out)?;
            section.encode_body()?.encode(&mut out)?;
        }
        if !self.explicit_keys.is_empty() {
            let mut body = Vec::new();
            for key in &self.explicit_keys {
                key_blob(key)?.encode(&mut body)?;
            }
            SECTION_EXPLICIT_KEY.encode(&mut out)?;
            body.encode(&mut out)?;
        }

        if let Some(key) = signer {
            SECTION_SIGNATURE.encode(&mut out)?;
            key_blob(key.public_key().key_data())?.encode(&mut out)?;
            let sig: Signature = key
                .try_sign(&out)
                .map_err(|e| CaError::Krl(format!("signing krl: {e}")))?;
            let mut sig_blob = Vec::new();
            sig.encode(&mut sig_blob)?;
            sig_blob.encode(&mut out)?;
        }

        Ok(out)
    }

    /// Parse a KRL. Signatures are checked for well-formedness and the signing
    /// keys recorded, and every signature present must verify.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut rest = bytes;

        let magic = u64::decode(&mut rest)?;
        if magic != KRL_MAGIC {
            return Err(CaError::Krl(format!("bad magic value {magic:x}")));
        }
        let format = u32::decode(&mut rest)?;
        if format != KRL_FORMAT_VERSION {
            return Err(CaError::Krl(format!("bad format version {format}")));
        }

        let mut krl = Self {
            version: u64::decode(&mut rest)?,
            generated_date: u64::decode(&mut rest)?,
            ..Self::default()
        };
        let _flags = u64::decode(&mut rest)?;
        let _reserved = Vec::<u8>::decode(&mut rest)?;
        krl.comment = String::decode(&mut rest)?;

        while rest.first().is_some_and(|&t| t != SECTION_SIGNATURE) {
            let kind = u8::decode(&mut rest)?;
            let body = Vec::<u8>::decode(&mut rest)?;
            match kind {
                SECTION_CERTIFICATES => {
                    krl.certificates.push(CertificateSection::parse_body(&body)?);
                }
                SECTION_EXPLICIT_KEY => {
                    let mut data = body.as_slice();
                    while !data.is_empty() {
                        let key = parse_key_blob(&Vec::<u8>::decode(&mut data)?)?;
                        krl.explicit_keys.push(key);
                    }
                }
                SECTION_FINGERPRINT_SHA1 => {
                    return Err(CaError::Krl(
                        "sha1 fingerprint sections are not supported".into(),
                    ))
                }
                other => return Err(CaError::Krl(format!("unexpected section type {other}"))),
            }
        }

        while !rest.is_empty() {
            let _ = u8::decode(&mut rest)?;
            let key = parse_key_blob(&Vec::<u8>::decode(&mut rest)?)?;
            // Everything up to and including the signing key is covered.
            let signed = &bytes[..bytes.len() - rest.len()];
            let sig_blob = Vec::<u8>::decode(&mut rest)?;
            let sig = Signature::decode(&mut sig_blob.as_slice())
                .map_err(|e| CaError::Krl(format!("malformed signature: {e}")))?;
            key.verify(signed, &sig)
                .map_err(|e| CaError::Krl(format!("bad signature: {e}")))?;
            krl.signing_keys.push(key);
        }

        debug!(
            cert_sections = krl.certificates.len(),
            keys = krl.explicit_keys.len(),
            "parsed krl"
        );
        Ok(krl)
    }

    /// Parse a KRL that must carry a valid signature from `ca`.
    pub fn parse_verified(bytes: &[u8], ca: &KeyData) -> Result<Self> {
        let krl = Self::parse(bytes)?;
        if krl.signing_keys.iter().any(|k| k == ca) {
            Ok(krl)
        } else {
            Err(CaError::Krl("krl is not signed by the expected key".into()))
        }
    }
}

fn key_blob(key: &KeyData) -> Result<Vec<u8>> {
    let mut blob = Vec::new();
    key.encode(&mut blob)?;
    Ok(blob)
}

fn parse_key_blob(blob: &[u8]) -> Result<KeyData> {
    let mut reader = blob;
    KeyData::decode(&mut reader).map_err(|e| CaError::Krl(format!("malformed key: {e}")))
}

// Bit 0 of the last byte is `offset`.
fn bitmap_has(bitmap: &[u8], offset: u64, serial: u64) -> bool {
    let Some(idx) = serial.checked_sub(offset) else {
        return false;
    };
    let Ok(byte_from_end) = usize::try_from(idx / 8) else {
        return false;
    };
    if byte_from_end >= bitmap.len() {
        return false;
    }
    let byte = bitmap[bitmap.len() - 1 - byte_from_end];
    byte & (1 << (idx % 8)) != 0
}

fn now_unix() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::certificate::{Builder, CertType};
    use ssh_key::rand_core::OsRng;
    use ssh_key::Algorithm;

    fn ca() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
    }

    fn cert_from(ca: &PrivateKey, key_id: &str, serial: u64) -> Certificate {
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let now = now_unix();
        let mut builder =
            Builder::new_with_random_nonce(&mut OsRng, subject.public_key(), now - 60, now + 3600)
                .unwrap();
        builder.serial(serial).unwrap();
        builder.key_id(key_id).unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.valid_principal("alice").unwrap();
        builder.sign(ca).unwrap()
    }

    #[test]
    fn test_key_id_membership_is_ca_scoped() {
        let ca_a = ca();
        let ca_b = ca();
        let mut krl = Krl::new();
        krl.revoke_key_ids(ca_a.public_key().key_data(), ["alice_100"]);

        let bytes = krl.encode(None).unwrap();
        let parsed = Krl::parse(&bytes).unwrap();

        assert!(parsed.is_revoked(&cert_from(&ca_a, "alice_100", 1)));
        assert!(!parsed.is_revoked(&cert_from(&ca_a, "alice_101", 1)));
        assert!(!parsed.is_revoked(&cert_from(&ca_b, "alice_100", 1)));
    }

    #[test]
    fn test_header_layout() {
        let krl = Krl {
            generated_date: 1_700_000_000,
            ..Krl::default()
        }
        .with_comment("test");
        let bytes = krl.encode(None).unwrap();
        assert_eq!(&bytes[..8], b"SSHKRL\n\0");
        assert_eq!(&bytes[8..12], &[0, 0, 0, 1]);
        // krl_version falls back to generated_date
        assert_eq!(&bytes[12..20], &1_700_000_000u64.to_be_bytes());
        assert_eq!(&bytes[20..28], &1_700_000_000u64.to_be_bytes());

        let parsed = Krl::parse(&bytes).unwrap();
        assert_eq!(parsed.comment, "test");
        assert!(parsed.certificates.is_empty());
    }

    #[test]
    fn test_empty_cert_section_is_omitted() {
        let ca = ca();
        let mut krl = Krl::new();
        krl.revoke_key_ids(ca.public_key().key_data(), Vec::<String>::new());
        let parsed = Krl::parse(&krl.encode(None).unwrap()).unwrap();
        assert!(parsed.certificates.is_empty());
    }

    #[test]
    fn test_serials_and_ranges() {
        let ca = ca();
        let ca_key = ca.public_key().key_data();
        let mut krl = Krl::new();
        krl.revoke_serials(ca_key, [7, 9]);
        krl.revoke_serial_range(ca_key, 100, 200).unwrap();
        assert!(krl.revoke_serial_range(ca_key, 5, 1).is_err());

        let parsed = Krl::parse(&krl.encode(None).unwrap()).unwrap();
        assert!(parsed.is_revoked(&cert_from(&ca, "x", 7)));
        assert!(parsed.is_revoked(&cert_from(&ca, "x", 150)));
        assert!(!parsed.is_revoked(&cert_from(&ca, "x", 8)));
    }

    #[test]
    fn test_explicit_key() {
        let ca = ca();
        let cert = cert_from(&ca, "bob_1", 1);
        let mut krl = Krl::new();
        krl.revoke_key(cert.public_key());
        let parsed = Krl::parse(&krl.encode(None).unwrap()).unwrap();
        assert!(parsed.is_revoked(&cert));
        assert!(parsed.is_key_revoked(cert.public_key()));
    }

    #[test]
    fn test_signed_krl_verifies() {
        let ca = ca();
        let mut krl = Krl::new();
        krl.revoke_key_ids(ca.public_key().key_data(), ["alice_1"]);
        let bytes = krl.encode(Some(&ca)).unwrap();

        let parsed = Krl::parse_verified(&bytes, ca.public_key().key_data()).unwrap();
        assert_eq!(parsed.signing_keys().len(), 1);

        let other = self::ca();
        assert!(Krl::parse_verified(&bytes, other.public_key().key_data()).is_err());
        // Unsigned lists never satisfy a signature requirement.
        let unsigned = krl.encode(None).unwrap();
        assert!(Krl::parse_verified(&unsigned, ca.public_key().key_data()).is_err());
    }

    #[test]
    fn test_tampered_krl_fails() {
        let ca = ca();
        let mut krl = Krl::new().with_comment("published");
        krl.revoke_key_ids(ca.public_key().key_data(), ["alice_1"]);
        let mut bytes = krl.encode(Some(&ca)).unwrap();
        // Flip a byte inside the comment.
        bytes[44] ^= 0x01;
        assert!(Krl::parse(&bytes).is_err());
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let mut bytes = Krl::new().encode(None).unwrap();
        assert!(Krl::parse(&bytes[..10]).is_err());
        bytes[0] = 0;
        assert!(matches!(Krl::parse(&bytes), Err(CaError::Krl(_))));
    }

    #[test]
    fn test_bitmap() {
        // offset 10, bits 0 and 9 set => serials 10 and 19
        let bitmap = [0b0000_0010, 0b0000_0001];
        assert!(bitmap_has(&bitmap, 10, 10));
        assert!(bitmap_has(&bitmap, 10, 19));
        assert!(!bitmap_has(&bitmap, 10, 11));
        assert!(!bitmap_has(&bitmap, 10, 9));
        assert!(!bitmap_has(&bitmap, 10, 100));
    }
}
