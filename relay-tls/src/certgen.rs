//! Leaf certificate minting and caching for the TLS stripper.
//!
//! Each SNI host gets an RSA-2048 leaf with `commonName` set to the host,
//! signed by the configured CA. Leaves are cached per host; the `Arc`
//! strong count is the in-use refcount and entries are kept for reuse.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509NameBuilder};
use rand::Rng;

pub struct LeafCert {
    pub cert: X509,
    pub key: PKey<Private>,
}

pub struct CertAuthority {
    ca_cert: X509,
    ca_key: PKey<Private>,
    cache: Mutex<HashMap<String, Arc<LeafCert>>>,
}

impl CertAuthority {
    pub fn new(ca_cert: X509, ca_key: PKey<Private>) -> Self {
        CertAuthority {
            ca_cert,
            ca_key,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(ca_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let ca_cert = X509::from_pem(
            &std::fs::read(ca_path)
                .with_context(|| format!("cannot read CA certificate {}", ca_path.display()))?,
        )?;
        let ca_key = PKey::private_key_from_pem(
            &std::fs::read(key_path)
                .with_context(|| format!("cannot read CA key {}", key_path.display()))?,
        )?;
        Ok(Self::new(ca_cert, ca_key))
    }

    pub fn get(&self, name: &str) -> anyhow::Result<Arc<LeafCert>> {
        if let Some(hit) = self.cache.lock().unwrap().get(name) {
            return Ok(hit.clone());
        }
        let leaf = Arc::new(self.mint(name)?);
        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), leaf.clone());
        Ok(leaf)
    }

    fn mint(&self, name: &str) -> anyhow::Result<LeafCert> {
        let key = PKey::from_rsa(Rsa::generate(2048)?)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let serial: u64 = rand::thread_rng().gen_range(50_000_000..100_000_000);
        let serial = BigNum::from_dec_str(&serial.to_string())?;
        let serial_asn1 = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial_asn1)?;

        let mut subject = X509NameBuilder::new()?;
        subject.append_entry_by_text("CN", name)?;
        builder.set_subject_name(&subject.build())?;
        builder.set_issuer_name(self.ca_cert.subject_name())?;
        builder.set_pubkey(&key)?;

        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let not_before = Asn1Time::from_unix(now - 24 * 60 * 60)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::from_unix(now + 7 * 24 * 60 * 60)?;
        builder.set_not_after(&not_after)?;

        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            SubjectKeyIdentifier::new()
                .build(&builder.x509v3_context(Some(&self.ca_cert), None))?,
        )?;
        builder.append_extension(
            AuthorityKeyIdentifier::new()
                .keyid(true)
                .build(&builder.x509v3_context(Some(&self.ca_cert), None))?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
        builder.append_extension(KeyUsage::new().digital_signature().build()?)?;

        builder.sign(&self.ca_key, MessageDigest::sha256())?;
        Ok(LeafCert {
            cert: builder.build(),
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::nid::Nid;

    fn test_ca() -> (X509, PKey<Private>) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "Relay Test CA").unwrap();
        let name = name.build();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        (builder.build(), key)
    }

    #[test]
    fn test_minted_leaf_has_sni_subject_and_bounded_serial() {
        let (ca_cert, ca_key) = test_ca();
        let authority = CertAuthority::new(ca_cert, ca_key);
        let leaf = authority.get("mitm.example.net").unwrap();

        let cn = leaf
            .cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap();
        assert_eq!(cn.data().as_slice(), b"mitm.example.net");

        let serial = leaf
            .cert
            .serial_number()
            .to_bn()
            .unwrap()
            .to_dec_str()
            .unwrap()
            .to_string();
        let serial: u64 = serial.parse().unwrap();
        assert!((50_000_000..100_000_000).contains(&serial));
    }

    #[test]
    fn test_leaf_is_signed_by_the_ca() {
        let (ca_cert, ca_key) = test_ca();
        let authority = CertAuthority::new(ca_cert.clone(), ca_key);
        let leaf = authority.get("signed.example").unwrap();
        assert!(leaf.cert.verify(&ca_cert.public_key().unwrap()).unwrap());
        assert_eq!(
            leaf.cert.issuer_name().entries().count(),
            ca_cert.subject_name().entries().count()
        );
    }

    #[test]
    fn test_cache_reuses_leaves_per_host() {
        let (ca_cert, ca_key) = test_ca();
        let authority = CertAuthority::new(ca_cert, ca_key);
        let a = authority.get("cached.example").unwrap();
        let b = authority.get("cached.example").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = authority.get("other.example").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
