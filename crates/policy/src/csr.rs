//! Decoding of PEM encoded certificate signing requests.
//!
//! The request bytes come straight from whoever created the
//! `CertificateSigningRequest`, so nothing in here may panic or bubble up an
//! error: every defect becomes a rejection message that inspectors return as
//! their verdict.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::cri_attributes::ParsedCriAttribute;
use x509_parser::extensions::{GeneralName, ParsedExtension, X509Extension};
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::signature_algorithm::SignatureAlgorithm as ParsedSignatureAlgorithm;
use x509_parser::x509::AlgorithmIdentifier;

const PEM_TAGS: [&str; 2] = ["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];
const SAN_OID: &str = "2.5.29.17";

/// A parsed, read-only view of a certificate request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRequest {
    /// DER encoding of the whole request
    pub raw: Vec<u8>,
    /// Subject common name, empty when absent
    pub common_name: String,
    /// Number of attributes across every RDN of the subject
    pub subject_attributes: usize,
    /// Requested subject alternative names in request order
    pub alt_names: Vec<AltName>,
    /// Requested X.509 extensions
    pub extensions: Vec<Extension>,
    /// Subject public key algorithm
    pub public_key: PublicKeyAlgorithm,
    /// Algorithm the request was signed with
    pub signature_algorithm: SignatureAlgorithm,
}

impl CertificateRequest {
    /// A subject made of anything but a single attribute is never accepted
    #[must_use]
    pub fn has_extra_names(&self) -> bool {
        self.subject_attributes > 1
    }

    /// Requested DNS names
    pub fn dns_names(&self) -> impl Iterator<Item = &str> {
        self.alt_names.iter().filter_map(|name| match name {
            AltName::Dns(dns) => Some(dns.as_str()),
            _ => None,
        })
    }

    /// Requested IP addresses
    pub fn ip_addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.alt_names.iter().filter_map(|name| match name {
            AltName::Ip(ip) => Some(*ip),
            _ => None,
        })
    }
}

/// A subject alternative name
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AltName {
    /// `dNSName`
    Dns(String),
    /// `iPAddress`
    Ip(IpAddr),
    /// `rfc822Name`
    Email(String),
    /// Any other `GeneralName` form, identified by its context tag
    Other {
        /// Context specific tag of the `GeneralName` choice
        tag: u8,
    },
}

impl AltName {
    /// The `GeneralName` context tag of this name
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            AltName::Email(_) => 1,
            AltName::Dns(_) => 2,
            AltName::Ip(_) => 7,
            AltName::Other { tag } => *tag,
        }
    }
}

impl fmt::Display for AltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AltName::Dns(name) => f.write_str(name),
            AltName::Ip(ip) => write!(f, "{ip}"),
            other => write!(f, "Name of type {}", other.tag()),
        }
    }
}

/// A requested X.509 extension
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extension {
    /// Dotted decimal object identifier
    pub oid: String,
    /// Criticality flag
    pub critical: bool,
    /// Raw extension value
    pub value: Vec<u8>,
}

/// Subject public key algorithm
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicKeyAlgorithm {
    /// RSA with the modulus size in bits
    Rsa {
        /// Modulus length
        bits: usize,
    },
    /// Elliptic curve key (`id-ecPublicKey`)
    Ecdsa,
    /// Ed25519 key
    Ed25519,
    /// Anything else, by OID
    Unknown(String),
}

/// Signature algorithm of a request
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignatureAlgorithm {
    Md2WithRsa,
    Md5WithRsa,
    Sha1WithRsa,
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    Sha256WithRsaPss,
    Sha384WithRsaPss,
    Sha512WithRsaPss,
    EcdsaWithSha1,
    EcdsaWithSha256,
    EcdsaWithSha384,
    EcdsaWithSha512,
    Ed25519,
    /// Unrecognised algorithm, by OID
    Unknown(String),
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Md2WithRsa => "MD2-RSA",
            Self::Md5WithRsa => "MD5-RSA",
            Self::Sha1WithRsa => "SHA1-RSA",
            Self::Sha256WithRsa => "SHA256-RSA",
            Self::Sha384WithRsa => "SHA384-RSA",
            Self::Sha512WithRsa => "SHA512-RSA",
            Self::Sha256WithRsaPss => "SHA256-RSAPSS",
            Self::Sha384WithRsaPss => "SHA384-RSAPSS",
            Self::Sha512WithRsaPss => "SHA512-RSAPSS",
            Self::EcdsaWithSha1 => "ECDSA-SHA1",
            Self::EcdsaWithSha256 => "ECDSA-SHA256",
            Self::EcdsaWithSha384 => "ECDSA-SHA384",
            Self::EcdsaWithSha512 => "ECDSA-SHA512",
            Self::Ed25519 => "Ed25519",
            Self::Unknown(oid) => oid,
        };
        f.write_str(name)
    }
}

/// Extracts the certificate request carried by a `CertificateSigningRequest`
///
/// # Errors
///
/// Returns the rejection message when the payload is not exactly one valid request
pub fn from_signing_request(
    request: &CertificateSigningRequest,
) -> Result<CertificateRequest, String> {
    extract(&request.spec.request.0)
}

/// Decodes exactly one PEM certificate request block.
///
/// # Errors
///
/// The error is a policy rejection message, never an I/O failure: missing PEM,
/// trailing PEM objects and unparseable requests are all reported this way.
pub fn extract(data: &[u8]) -> Result<CertificateRequest, String> {
    let Ok(blocks) = pem::parse_many(data) else {
        // A readable first block means the failure is in what follows it
        if pem::parse(data).is_ok() {
            return Err("Request had more than one PEM object".to_string());
        }
        return Err("Request did not have a parseable PEM object".to_string());
    };

    let block = match blocks.as_slice() {
        [] => return Err("Request did not have a parseable PEM object".to_string()),
        [block] => block,
        _ => return Err("Request had more than one PEM object".to_string()),
    };

    if !PEM_TAGS.contains(&block.tag()) {
        return Err(format!(
            "Request had invalid certificate request: unexpected PEM type {:?}",
            block.tag()
        ));
    }

    parse_der(block.contents())
        .map_err(|reason| format!("Request had invalid certificate request: {reason}"))
}

fn parse_der(der: &[u8]) -> Result<CertificateRequest, String> {
    let (rest, csr) = X509CertificationRequest::from_der(der).map_err(|e| e.to_string())?;
    if !rest.is_empty() {
        return Err("trailing data".to_string());
    }

    let info = &csr.certification_request_info;

    let common_name = match info.subject.iter_common_name().next() {
        Some(attr) => attr
            .as_str()
            .map_err(|e| format!("common name is not a string: {e}"))?
            .to_string(),
        None => String::new(),
    };

    let mut extensions = Vec::new();
    let mut alt_names = Vec::new();
    for attribute in info.attributes() {
        if let ParsedCriAttribute::ExtensionRequest(request) = attribute.parsed_attribute() {
            for extension in &request.extensions {
                collect_alt_names(extension, &mut alt_names)?;
                extensions.push(Extension {
                    oid: extension.oid.to_id_string(),
                    critical: extension.critical,
                    value: extension.value.to_vec(),
                });
            }
        }
    }

    let public_key = match info.subject_pki.algorithm.algorithm.to_id_string().as_str() {
        "1.2.840.113549.1.1.1" => match info.subject_pki.parsed() {
            Ok(PublicKey::RSA(key)) => PublicKeyAlgorithm::Rsa {
                bits: key.key_size(),
            },
            Ok(_) => return Err("RSA public key has an unexpected encoding".to_string()),
            Err(e) => return Err(format!("malformed RSA public key: {e}")),
        },
        "1.2.840.10045.2.1" => PublicKeyAlgorithm::Ecdsa,
        "1.3.101.112" => PublicKeyAlgorithm::Ed25519,
        other => PublicKeyAlgorithm::Unknown(other.to_string()),
    };

    Ok(CertificateRequest {
        raw: der.to_vec(),
        common_name,
        subject_attributes: info.subject.iter_attributes().count(),
        alt_names,
        extensions,
        public_key,
        signature_algorithm: signature_algorithm(&csr.signature_algorithm),
    })
}

fn collect_alt_names(
    extension: &X509Extension<'_>,
    names: &mut Vec<AltName>,
) -> Result<(), String> {
    let san = match extension.parsed_extension() {
        ParsedExtension::SubjectAlternativeName(san) => san,
        ParsedExtension::ParseError { error } if extension.oid.to_id_string() == SAN_OID => {
            return Err(format!("invalid subjectAltName: {error}"));
        }
        _ => return Ok(()),
    };

    for name in &san.general_names {
        let name = match name {
            GeneralName::DNSName(dns) => AltName::Dns((*dns).to_string()),
            GeneralName::RFC822Name(email) => AltName::Email((*email).to_string()),
            GeneralName::IPAddress(bytes) => match ip_from_bytes(bytes) {
                Some(ip) => AltName::Ip(ip),
                None => AltName::Other { tag: 7 },
            },
            GeneralName::OtherName(..) => AltName::Other { tag: 0 },
            GeneralName::X400Address(_) => AltName::Other { tag: 3 },
            GeneralName::DirectoryName(_) => AltName::Other { tag: 4 },
            GeneralName::EDIPartyName(_) => AltName::Other { tag: 5 },
            GeneralName::URI(_) => AltName::Other { tag: 6 },
            GeneralName::RegisteredID(_) => AltName::Other { tag: 8 },
            #[allow(unreachable_patterns)]
            _ => AltName::Other { tag: u8::MAX },
        };
        names.push(name);
    }
    Ok(())
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    <[u8; 16]>::try_from(bytes)
        .ok()
        .map(|octets| IpAddr::V6(Ipv6Addr::from(octets)))
}

fn signature_algorithm(alg: &AlgorithmIdentifier<'_>) -> SignatureAlgorithm {
    match alg.algorithm.to_id_string().as_str() {
        "1.2.840.113549.1.1.2" => SignatureAlgorithm::Md2WithRsa,
        "1.2.840.113549.1.1.4" => SignatureAlgorithm::Md5WithRsa,
        "1.2.840.113549.1.1.5" => SignatureAlgorithm::Sha1WithRsa,
        "1.2.840.113549.1.1.11" => SignatureAlgorithm::Sha256WithRsa,
        "1.2.840.113549.1.1.12" => SignatureAlgorithm::Sha384WithRsa,
        "1.2.840.113549.1.1.13" => SignatureAlgorithm::Sha512WithRsa,
        "1.2.840.113549.1.1.10" => rsa_pss(alg),
        "1.2.840.10045.4.1" => SignatureAlgorithm::EcdsaWithSha1,
        "1.2.840.10045.4.3.2" => SignatureAlgorithm::EcdsaWithSha256,
        "1.2.840.10045.4.3.3" => SignatureAlgorithm::EcdsaWithSha384,
        "1.2.840.10045.4.3.4" => SignatureAlgorithm::EcdsaWithSha512,
        "1.3.101.112" => SignatureAlgorithm::Ed25519,
        other => SignatureAlgorithm::Unknown(other.to_string()),
    }
}

// RSASSA-PSS carries its hash in the algorithm parameters
fn rsa_pss(alg: &AlgorithmIdentifier<'_>) -> SignatureAlgorithm {
    let unknown = || SignatureAlgorithm::Unknown(alg.algorithm.to_id_string());

    let Ok(ParsedSignatureAlgorithm::RSASSA_PSS(params)) = ParsedSignatureAlgorithm::try_from(alg)
    else {
        return unknown();
    };
    let Some(hash) = params.hash_algorithm() else {
        return unknown();
    };

    match hash.algorithm.to_id_string().as_str() {
        "2.16.840.1.101.3.4.2.1" => SignatureAlgorithm::Sha256WithRsaPss,
        "2.16.840.1.101.3.4.2.2" => SignatureAlgorithm::Sha384WithRsaPss,
        "2.16.840.1.101.3.4.2.3" => SignatureAlgorithm::Sha512WithRsaPss,
        _ => unknown(),
    }
}
