#![allow(dead_code, clippy::unwrap_used)]

use dapr_cert_manager_helper::{Certificate, CertificateBundle};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

/// Self-signed CA certificate as PEM.
pub fn ca_pem(common_name: &str) -> String {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let key_pair = KeyPair::generate().unwrap();
    params.self_signed(&key_pair).unwrap().pem()
}

pub fn certificate(pem: &str) -> Certificate {
    Certificate::try_from(pem::parse(pem).unwrap().contents()).unwrap()
}

pub fn bundle<S: AsRef<str>>(pems: &[S]) -> CertificateBundle {
    pems.iter().map(|pem| certificate(pem.as_ref())).collect()
}
