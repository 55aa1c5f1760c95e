//! Clockless certificate trust evaluation.
//!
//! Chain verification normally leans on wall-clock time for the
//! not-before/not-after window. This kernel has no clock, so the window
//! check is governed by an explicit [`TrustPolicy`]: either it is checked
//! against an externally injected "assumed current time" (a
//! provisioning-time stamp, for instance), or it is skipped — and the skip
//! is *declared* in the verdict. Callers can always tell a clean
//! [`TrustVerdict::Trusted`] from
//! [`TrustVerdict::TrustedValidityUnchecked`].
//!
//! Signature-chain verification and name matching run exactly as a
//! clocked implementation would. The RSA/SHA primitives live in the
//! external engine and are reached through [`SignatureBackend`].

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

bitflags::bitflags! {
    /// X.509 key usage bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyUsage: u16 {
        const DIGITAL_SIGNATURE = 1 << 0;
        const NON_REPUDIATION   = 1 << 1;
        const KEY_ENCIPHERMENT  = 1 << 2;
        const DATA_ENCIPHERMENT = 1 << 3;
        const KEY_AGREEMENT     = 1 << 4;
        const KEY_CERT_SIGN     = 1 << 5;
        const CRL_SIGN          = 1 << 6;
    }
}

/// Signature schemes the profile enables (PKCS#1 v1.5 with SHA-2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// sha256WithRSAEncryption.
    RsaPkcs1Sha256,
    /// sha512WithRSAEncryption.
    RsaPkcs1Sha512,
}

/// One certificate of the peer's chain, as produced by the external
/// X.509 parser. Leaf first, issuers following.
#[derive(Debug, Clone)]
pub struct ChainLink {
    /// Raw DER bytes.
    pub raw: Vec<u8>,
    /// The to-be-signed portion.
    pub tbs: Vec<u8>,
    /// Signature over `tbs`, made with the issuer's key.
    pub signature: Vec<u8>,
    /// Signature scheme, when the parser recognized the OID.
    pub scheme: Option<SignatureScheme>,
    /// Subject distinguished name, rendered.
    pub subject: String,
    /// Issuer distinguished name, rendered.
    pub issuer: String,
    /// Subject common name, if present.
    pub subject_cn: Option<String>,
    /// dNSName entries of the subjectAltName extension.
    pub dns_names: Vec<String>,
    /// SubjectPublicKeyInfo bytes.
    pub spki: Vec<u8>,
    /// notBefore as seconds since the Unix epoch.
    pub not_before: i64,
    /// notAfter as seconds since the Unix epoch.
    pub not_after: i64,
    /// Key usage bits; empty when the extension is absent.
    pub key_usage: KeyUsage,
    /// Basic constraints CA flag.
    pub is_ca: bool,
}

/// A certificate pre-configured as authoritative for chain verification.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    /// Subject distinguished name of the anchor.
    pub subject: String,
    /// SubjectPublicKeyInfo of the anchor.
    pub spki: Vec<u8>,
}

/// Why a chain was rejected. Every rejection is fatal to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No continuous issuer path to a configured trust anchor.
    ChainBroken,
    /// The leaf matches neither the expected name nor any dNSName.
    NameMismatch,
    /// A signature link failed to verify.
    SignatureInvalid,
    /// A policy check (key usage, validity under assumed time) failed.
    PolicyViolation,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ChainBroken => write!(f, "chain broken"),
            RejectReason::NameMismatch => write!(f, "name mismatch"),
            RejectReason::SignatureInvalid => write!(f, "signature invalid"),
            RejectReason::PolicyViolation => write!(f, "policy violation"),
        }
    }
}

/// Successful evaluation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustVerdict {
    /// Every enforced check passed, including the validity window.
    Trusted,
    /// Every enforced check passed, but the validity window was skipped
    /// because no time source is configured. The omission is a declared
    /// risk the caller must account for.
    TrustedValidityUnchecked,
}

/// Stance on the validity-period check in the absence of a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityMode {
    /// No time source: skip the window check and declare it in the
    /// verdict.
    Unverifiable,
    /// Check the window against this externally supplied time (seconds
    /// since the Unix epoch).
    AssumedTime(i64),
}

/// Which checks are enforced and how validity is handled.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    /// Match the leaf against the expected server name.
    pub check_name: bool,
    /// Enforce key-usage constraints along the chain.
    pub check_key_usage: bool,
    /// Validity-window stance.
    pub validity: ValidityMode,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        TrustPolicy {
            check_name: true,
            check_key_usage: true,
            validity: ValidityMode::Unverifiable,
        }
    }
}

/// Signature verification primitive supplied by the external engine.
pub trait SignatureBackend {
    /// Verify `signature` over `tbs` against the key in `spki`.
    fn verify(&self, scheme: SignatureScheme, spki: &[u8], tbs: &[u8], signature: &[u8]) -> bool;
}

/// Chain evaluator combining policy, anchors, and the signature backend.
pub struct TrustEvaluator<B: SignatureBackend> {
    policy: TrustPolicy,
    anchors: Vec<TrustAnchor>,
    backend: B,
}

impl<B: SignatureBackend> TrustEvaluator<B> {
    /// Build an evaluator over the given anchors.
    pub fn new(policy: TrustPolicy, anchors: Vec<TrustAnchor>, backend: B) -> Self {
        TrustEvaluator {
            policy,
            anchors,
            backend,
        }
    }

    /// The active policy.
    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// Evaluate a chain (leaf first) against `expected_name`.
    ///
    /// Signature-chain verification is unconditional: a broken signature
    /// link is rejected regardless of policy settings. Name, key-usage,
    /// and validity checks follow the policy.
    pub fn evaluate(
        &self,
        chain: &[ChainLink],
        expected_name: &str,
    ) -> Result<TrustVerdict, RejectReason> {
        if chain.is_empty() {
            return Err(RejectReason::ChainBroken);
        }

        self.verify_signatures(chain)?;

        if self.policy.check_name && !name_matches(&chain[0], expected_name) {
            log::warn!(
                "[TLS Trust] leaf does not match expected name {}",
                expected_name
            );
            return Err(RejectReason::NameMismatch);
        }

        if self.policy.check_key_usage {
            self.verify_key_usage(chain)?;
        }

        match self.policy.validity {
            ValidityMode::AssumedTime(now) => {
                for link in chain {
                    if now < link.not_before || now > link.not_after {
                        log::warn!(
                            "[TLS Trust] {} outside validity window at assumed time {}",
                            link.subject,
                            now
                        );
                        return Err(RejectReason::PolicyViolation);
                    }
                }
                Ok(TrustVerdict::Trusted)
            }
            ValidityMode::Unverifiable => Ok(TrustVerdict::TrustedValidityUnchecked),
        }
    }

    /// Walk the chain verifying each link against its issuer, then the
    /// last link against a configured anchor.
    fn verify_signatures(&self, chain: &[ChainLink]) -> Result<(), RejectReason> {
        for i in 0..chain.len() - 1 {
            let link = &chain[i];
            let issuer = &chain[i + 1];
            if link.issuer != issuer.subject {
                return Err(RejectReason::ChainBroken);
            }
            self.verify_one(link, &issuer.spki)?;
        }

        let last = &chain[chain.len() - 1];
        let anchor = self
            .anchors
            .iter()
            .find(|a| a.subject == last.issuer)
            .ok_or(RejectReason::ChainBroken)?;
        self.verify_one(last, &anchor.spki)
    }

    fn verify_one(&self, link: &ChainLink, issuer_spki: &[u8]) -> Result<(), RejectReason> {
        let scheme = link.scheme.ok_or(RejectReason::SignatureInvalid)?;
        if self
            .backend
            .verify(scheme, issuer_spki, &link.tbs, &link.signature)
        {
            Ok(())
        } else {
            log::warn!("[TLS Trust] signature check failed for {}", link.subject);
            Err(RejectReason::SignatureInvalid)
        }
    }

    fn verify_key_usage(&self, chain: &[ChainLink]) -> Result<(), RejectReason> {
        // RSA key exchange encrypts the pre-master secret to the leaf
        // key, so the leaf must allow key encipherment.
        let leaf = &chain[0];
        if !leaf.key_usage.is_empty() && !leaf.key_usage.contains(KeyUsage::KEY_ENCIPHERMENT) {
            return Err(RejectReason::PolicyViolation);
        }

        for issuer in &chain[1..] {
            if !issuer.is_ca {
                return Err(RejectReason::PolicyViolation);
            }
            if !issuer.key_usage.is_empty() && !issuer.key_usage.contains(KeyUsage::KEY_CERT_SIGN) {
                return Err(RejectReason::PolicyViolation);
            }
        }
        Ok(())
    }
}

/// Match `expected` against the leaf's dNSNames, falling back to the CN
/// when no subjectAltName entries are present.
fn name_matches(leaf: &ChainLink, expected: &str) -> bool {
    if !leaf.dns_names.is_empty() {
        return leaf.dns_names.iter().any(|n| host_matches(n, expected));
    }
    match &leaf.subject_cn {
        Some(cn) => host_matches(cn, expected),
        None => false,
    }
}

/// Case-insensitive hostname match with a single leftmost wildcard label.
fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern.eq_ignore_ascii_case(host) {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        // The wildcard covers exactly one label.
        if let Some((_, host_suffix)) = host.split_once('.') {
            return suffix.eq_ignore_ascii_case(host_suffix);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    /// Backend that accepts a signature iff it is the issuer spki XORed
    /// into a one-byte checksum of the tbs bytes.
    struct ChecksumBackend;

    fn checksum(spki: &[u8], tbs: &[u8]) -> u8 {
        spki.iter().chain(tbs.iter()).fold(0u8, |a, &b| a ^ b)
    }

    impl SignatureBackend for ChecksumBackend {
        fn verify(
            &self,
            _scheme: SignatureScheme,
            spki: &[u8],
            tbs: &[u8],
            signature: &[u8],
        ) -> bool {
            signature.len() == 1 && signature[0] == checksum(spki, tbs)
        }
    }

    fn link(subject: &str, issuer: &str, issuer_spki: &[u8], ca: bool) -> ChainLink {
        let tbs = subject.as_bytes().to_vec();
        ChainLink {
            raw: tbs.clone(),
            tbs: tbs.clone(),
            signature: vec![checksum(issuer_spki, &tbs)],
            scheme: Some(SignatureScheme::RsaPkcs1Sha256),
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            subject_cn: Some(subject.trim_start_matches("CN=").to_string()),
            dns_names: Vec::new(),
            spki: subject.as_bytes().to_vec(),
            not_before: 1_000,
            not_after: 2_000,
            key_usage: if ca {
                KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN
            } else {
                KeyUsage::KEY_ENCIPHERMENT | KeyUsage::DIGITAL_SIGNATURE
            },
            is_ca: ca,
        }
    }

    fn anchors() -> Vec<TrustAnchor> {
        vec![TrustAnchor {
            subject: "CN=root".to_string(),
            spki: b"CN=root".to_vec(),
        }]
    }

    fn chain() -> Vec<ChainLink> {
        vec![
            link("CN=host.test", "CN=mid", b"CN=mid", false),
            link("CN=mid", "CN=root", b"CN=root", true),
        ]
    }

    fn evaluator(policy: TrustPolicy) -> TrustEvaluator<ChecksumBackend> {
        TrustEvaluator::new(policy, anchors(), ChecksumBackend)
    }

    #[test]
    fn test_skip_policy_declares_unverified_validity() {
        let eval = evaluator(TrustPolicy::default());
        let verdict = eval.evaluate(&chain(), "host.test").unwrap();
        assert_eq!(verdict, TrustVerdict::TrustedValidityUnchecked);
    }

    #[test]
    fn test_assumed_time_inside_window_is_clean_trusted() {
        let eval = evaluator(TrustPolicy {
            validity: ValidityMode::AssumedTime(1_500),
            ..TrustPolicy::default()
        });
        let verdict = eval.evaluate(&chain(), "host.test").unwrap();
        assert_eq!(verdict, TrustVerdict::Trusted);
    }

    #[test]
    fn test_expired_chain_under_skip_policy_still_trusted_but_declared() {
        // Chain is expired relative to any plausible time, but the policy
        // has no time source: the result must be the declared-risk
        // verdict, not a rejection and not a clean Trusted.
        let eval = evaluator(TrustPolicy::default());
        let verdict = eval.evaluate(&chain(), "host.test").unwrap();
        assert_eq!(verdict, TrustVerdict::TrustedValidityUnchecked);

        let clocked = evaluator(TrustPolicy {
            validity: ValidityMode::AssumedTime(5_000),
            ..TrustPolicy::default()
        });
        assert_eq!(
            clocked.evaluate(&chain(), "host.test"),
            Err(RejectReason::PolicyViolation)
        );
    }

    #[test]
    fn test_broken_signature_rejected_regardless_of_policy() {
        let mut bad = chain();
        bad[0].signature[0] ^= 0xFF;

        for policy in [
            TrustPolicy::default(),
            TrustPolicy {
                check_name: false,
                check_key_usage: false,
                validity: ValidityMode::Unverifiable,
            },
            TrustPolicy {
                validity: ValidityMode::AssumedTime(1_500),
                ..TrustPolicy::default()
            },
        ] {
            let eval = evaluator(policy);
            assert_eq!(
                eval.evaluate(&bad, "host.test"),
                Err(RejectReason::SignatureInvalid)
            );
        }
    }

    #[test]
    fn test_unknown_root_is_chain_broken() {
        let bad = vec![link("CN=host.test", "CN=stranger", b"CN=stranger", false)];
        let eval = evaluator(TrustPolicy::default());
        assert_eq!(
            eval.evaluate(&bad, "host.test"),
            Err(RejectReason::ChainBroken)
        );
    }

    #[test]
    fn test_issuer_subject_mismatch_is_chain_broken() {
        let mut bad = chain();
        bad[1].subject = "CN=other".to_string();
        let eval = evaluator(TrustPolicy::default());
        assert_eq!(
            eval.evaluate(&bad, "host.test"),
            Err(RejectReason::ChainBroken)
        );
    }

    #[test]
    fn test_name_mismatch_rejected() {
        let eval = evaluator(TrustPolicy::default());
        assert_eq!(
            eval.evaluate(&chain(), "elsewhere.test"),
            Err(RejectReason::NameMismatch)
        );
    }

    #[test]
    fn test_san_wildcard_match() {
        let mut c = chain();
        c[0].dns_names = vec!["*.example.test".to_string()];
        let eval = evaluator(TrustPolicy::default());
        assert!(eval.evaluate(&c, "www.example.test").is_ok());
        // One label only.
        assert_eq!(
            eval.evaluate(&c, "a.b.example.test"),
            Err(RejectReason::NameMismatch)
        );
    }

    #[test]
    fn test_leaf_without_key_encipherment_violates_policy() {
        let mut c = chain();
        c[0].key_usage = KeyUsage::DIGITAL_SIGNATURE;
        let eval = evaluator(TrustPolicy::default());
        assert_eq!(
            eval.evaluate(&c, "host.test"),
            Err(RejectReason::PolicyViolation)
        );
    }

    #[test]
    fn test_non_ca_issuer_violates_policy() {
        let mut c = chain();
        c[1].is_ca = false;
        let eval = evaluator(TrustPolicy::default());
        assert_eq!(
            eval.evaluate(&c, "host.test"),
            Err(RejectReason::PolicyViolation)
        );
    }

    #[test]
    fn test_empty_chain_is_chain_broken() {
        let eval = evaluator(TrustPolicy::default());
        assert_eq!(
            eval.evaluate(&[], "host.test"),
            Err(RejectReason::ChainBroken)
        );
    }
}
