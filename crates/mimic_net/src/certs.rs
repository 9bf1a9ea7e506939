use boring::asn1::Asn1Time;
use boring::bn::{BigNum, MsbOption};
use boring::ec::{EcGroup, EcKey};
use boring::error::ErrorStack;
use boring::hash::MessageDigest;
use boring::nid::Nid;
use boring::pkey::{PKey, Private};
use boring::ssl::{select_next_proto, AlpnError, SslAcceptor, SslMethod};
use boring::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use boring::x509::{X509Name, X509NameBuilder, X509};
use dashmap::DashMap;
use mimic_traits::{MimicError, Result};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info};

const CA_COMMON_NAME: &str = "mimic interception CA";
const LEAF_VALIDITY_DAYS: u32 = 397;
const CA_VALIDITY_DAYS: u32 = 3650;

fn cert_err(e: ErrorStack) -> MimicError {
    MimicError::Certificate(e.to_string())
}

/// Local CA that signs per-host leaves for intercepted connections.
pub struct CertificateAuthority {
    cert: X509,
    key: PKey<Private>,
    acceptors: DashMap<String, SslAcceptor>,
}

fn generate_key() -> std::result::Result<PKey<Private>, ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    PKey::from_ec_key(EcKey::generate(&group)?)
}

fn common_name(cn: &str) -> std::result::Result<X509Name, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    Ok(name.build())
}

fn random_serial() -> std::result::Result<boring::asn1::Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
    serial.to_asn1_integer()
}

impl CertificateAuthority {
    /// A throwaway CA; its certificate must be exported and trusted by the client.
    pub fn generate() -> Result<Self> {
        let key = generate_key().map_err(cert_err)?;
        let cert = Self::self_signed(&key).map_err(cert_err)?;
        info!("generated ephemeral interception CA");
        Ok(Self::from_parts(cert, key))
    }

    fn self_signed(key: &PKey<Private>) -> std::result::Result<X509, ErrorStack> {
        let name = common_name(CA_COMMON_NAME)?;
        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&random_serial()?)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(key)?;
        builder.set_not_before(&Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&Asn1Time::days_from_now(CA_VALIDITY_DAYS)?)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
        builder.sign(key, MessageDigest::sha256())?;
        Ok(builder.build())
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert = X509::from_pem(cert_pem).map_err(cert_err)?;
        let key = PKey::private_key_from_pem(key_pem).map_err(cert_err)?;
        Ok(Self::from_parts(cert, key))
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| MimicError::Certificate(format!("read {}: {e}", path.display())))
        };
        let ca = Self::from_pem(&read(cert_path)?, &read(key_path)?)?;
        info!(cert = %cert_path.display(), "loaded interception CA");
        Ok(ca)
    }

    fn from_parts(cert: X509, key: PKey<Private>) -> Self {
        Self {
            cert,
            key,
            acceptors: DashMap::new(),
        }
    }

    pub fn certificate(&self) -> &X509 {
        &self.cert
    }

    pub fn cert_pem(&self) -> Result<Vec<u8>> {
        self.cert.to_pem().map_err(cert_err)
    }

    pub fn key_pem(&self) -> Result<Vec<u8>> {
        self.key.private_key_to_pem_pkcs8().map_err(cert_err)
    }

    /// Writes the CA certificate so it can be installed in the client's trust store.
    pub fn write_cert(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.cert_pem()?)
            .map_err(|e| MimicError::Certificate(format!("write {}: {e}", path.display())))
    }

    /// Leaf certificate and key for `host`, signed by this CA.
    pub fn issue(&self, host: &str) -> Result<(X509, PKey<Private>)> {
        self.issue_leaf(host).map_err(cert_err)
    }

    fn issue_leaf(&self, host: &str) -> std::result::Result<(X509, PKey<Private>), ErrorStack> {
        let key = generate_key()?;
        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&random_serial()?)?;
        builder.set_subject_name(&common_name(host)?)?;
        builder.set_issuer_name(self.cert.subject_name())?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&Asn1Time::days_from_now(LEAF_VALIDITY_DAYS)?)?;

        let mut san = SubjectAlternativeName::new();
        if host.parse::<IpAddr>().is_ok() {
            san.ip(host);
        } else {
            san.dns(host);
        }
        let san = san.build(&builder.x509v3_context(Some(&self.cert), None))?;
        builder.append_extension(san)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        let usage = KeyUsage::new().critical().digital_signature().key_encipherment().build()?;
        builder.append_extension(usage)?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
        builder.sign(&self.key, MessageDigest::sha256())?;
        Ok((builder.build(), key))
    }

    /// Server-side TLS context presenting a leaf for `host`, cached per host.
    ///
    /// Only `http/1.1` is offered over ALPN.
    pub fn acceptor_for(&self, host: &str) -> Result<SslAcceptor> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(acceptor) = self.acceptors.get(&host) {
            return Ok(acceptor.value().clone());
        }

        let (leaf, key) = self.issue(&host)?;
        let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls()).map_err(cert_err)?;
        builder.set_private_key(&key).map_err(cert_err)?;
        builder.set_certificate(&leaf).map_err(cert_err)?;
        builder.add_extra_chain_cert(self.cert.clone()).map_err(cert_err)?;
        builder.set_alpn_select_callback(|_, client| {
            select_next_proto(b"\x08http/1.1", client).ok_or(AlpnError::NOACK)
        });
        let acceptor = builder.build();

        debug!(%host, "issued leaf certificate");
        self.acceptors.insert(host, acceptor.clone());
        Ok(acceptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boring::x509::X509StoreContext;
    use boring::x509::store::X509StoreBuilder;
    use boring::stack::Stack;

    fn verifies(ca: &X509, leaf: &X509) -> bool {
        let mut store = X509StoreBuilder::new().unwrap();
        store.add_cert(ca.clone()).unwrap();
        let store = store.build();
        let chain: Stack<X509> = Stack::new().unwrap();
        let mut ctx = X509StoreContext::new().unwrap();
        ctx.init(&store, leaf, &chain, |c| c.verify_cert()).unwrap()
    }

    #[test]
    fn leaves_chain_to_the_ca() {
        let ca = CertificateAuthority::generate().unwrap();
        let (leaf, _) = ca.issue("example.com").unwrap();
        assert!(verifies(ca.certificate(), &leaf));

        let names: Vec<String> = leaf
            .subject_alt_names()
            .unwrap()
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["example.com".to_string()]);
    }

    #[test]
    fn pem_round_trip_keeps_signing_key() {
        let ca = CertificateAuthority::generate().unwrap();
        let (cert_pem, key_pem) = (ca.cert_pem().unwrap(), ca.key_pem().unwrap());
        let reloaded = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
        let (leaf, _) = reloaded.issue("127.0.0.1").unwrap();
        assert!(verifies(ca.certificate(), &leaf));
    }

    #[test]
    fn acceptors_are_cached_per_host() {
        let ca = CertificateAuthority::generate().unwrap();
        ca.acceptor_for("a.test").unwrap();
        ca.acceptor_for("A.test.").unwrap();
        ca.acceptor_for("b.test").unwrap();
        assert_eq!(ca.acceptors.len(), 2);
    }

    #[test]
    fn garbage_pem_is_a_certificate_error() {
        let err = CertificateAuthority::from_pem(b"nope", b"nope").err().unwrap();
        assert!(matches!(err, MimicError::Certificate(_)));
    }
}
