//! Cluster metadata detectors.
//!
//! Each detector fills one metadata key. Several detectors may target the
//! same key; the result with the highest accuracy wins.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use k8s_openapi::apimachinery::pkg::version::Info;
use serde_json::Value;

use crate::models::cluster::{metadata_key, ClusterMetadata};

type BoxFuture<'a> = Pin<Box<dyn Future<Output = Option<DetectionResult>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub value: Value,
    pub accuracy: u32,
}

impl DetectionResult {
    pub fn new(value: impl Into<Value>, accuracy: u32) -> Self {
        Self {
            value: value.into(),
            accuracy,
        }
    }
}

/// What a detector may look at.
pub struct DetectTarget {
    pub api_url: String,
    pub client: reqwest::Client,
}

impl DetectTarget {
    async fn version_info(&self) -> Option<Info> {
        let url = format!("{}/version", self.api_url.trim_end_matches('/'));
        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                log::debug!("detectors: {url} answered {}", r.status());
                return None;
            }
            Err(e) => {
                log::debug!("detectors: {url} failed: {e}");
                return None;
            }
        };
        match response.json::<Info>().await {
            Ok(info) => Some(info),
            Err(e) => {
                log::debug!("detectors: unreadable version info: {e}");
                None
            }
        }
    }
}

pub trait Detector: Send + Sync {
    /// Metadata key this detector fills.
    fn key(&self) -> &'static str;

    /// `None` when nothing could be detected.
    fn detect<'a>(&'a self, target: &'a DetectTarget) -> BoxFuture<'a>;
}

/// Kubernetes version as reported by the API server.
pub struct VersionDetector;

impl Detector for VersionDetector {
    fn key(&self) -> &'static str {
        metadata_key::VERSION
    }

    fn detect<'a>(&'a self, target: &'a DetectTarget) -> BoxFuture<'a> {
        Box::pin(async move {
            let info = target.version_info().await?;
            Some(DetectionResult::new(info.git_version, 100))
        })
    }
}

/// Distribution guessed from markers in the version string.
pub struct DistributionDetector;

const DISTRIBUTION_MARKERS: &[(&str, &str)] = &[
    ("+k3s", "k3s"),
    ("+rke2", "rke2"),
    ("-gke.", "gke"),
    ("-eks-", "eks"),
    ("+IKS", "iks"),
    ("+vmware", "vmware"),
    ("-mirantis-", "mirantis"),
];

pub fn distribution_from_version(git_version: &str) -> Option<&'static str> {
    DISTRIBUTION_MARKERS
        .iter()
        .find(|(marker, _)| git_version.contains(marker))
        .map(|(_, name)| *name)
}

impl Detector for DistributionDetector {
    fn key(&self) -> &'static str {
        metadata_key::DISTRIBUTION
    }

    fn detect<'a>(&'a self, target: &'a DetectTarget) -> BoxFuture<'a> {
        Box::pin(async move {
            let info = target.version_info().await?;
            Some(match distribution_from_version(&info.git_version) {
                Some(name) => DetectionResult::new(name, 90),
                None => DetectionResult::new("unknown", 10),
            })
        })
    }
}

/// Time of the last successful contact.
pub struct LastSeenDetector;

impl Detector for LastSeenDetector {
    fn key(&self) -> &'static str {
        metadata_key::LAST_SEEN
    }

    fn detect<'a>(&'a self, _target: &'a DetectTarget) -> BoxFuture<'a> {
        Box::pin(async move { Some(DetectionResult::new(chrono::Utc::now().to_rfc3339(), 100)) })
    }
}

/// The detectors run on every connect.
pub struct DetectorSet {
    detectors: Vec<Box<dyn Detector>>,
}

impl Default for DetectorSet {
    fn default() -> Self {
        Self::new(vec![
            Box::new(VersionDetector),
            Box::new(DistributionDetector),
            Box::new(LastSeenDetector),
        ])
    }
}

impl DetectorSet {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    /// Runs every detector and keeps the most accurate value per key.
    pub async fn detect(&self, target: &DetectTarget) -> ClusterMetadata {
        let mut best: BTreeMap<&'static str, DetectionResult> = BTreeMap::new();
        for detector in &self.detectors {
            let Some(result) = detector.detect(target).await else {
                continue;
            };
            match best.get(detector.key()) {
                Some(current) if current.accuracy >= result.accuracy => {}
                _ => {
                    best.insert(detector.key(), result);
                }
            }
        }
        best.into_iter()
            .map(|(key, result)| (key.to_string(), result.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve, VERSION_BODY};
    use serde_json::json;
    use std::time::Duration;

    struct Fixed(&'static str, &'static str, u32);

    impl Detector for Fixed {
        fn key(&self) -> &'static str {
            self.0
        }

        fn detect<'a>(&'a self, _: &'a DetectTarget) -> BoxFuture<'a> {
            Box::pin(async move { Some(DetectionResult::new(self.1, self.2)) })
        }
    }

    fn target(api_url: String) -> DetectTarget {
        DetectTarget {
            api_url,
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn distribution_markers() {
        assert_eq!(distribution_from_version("v1.30.2+k3s1"), Some("k3s"));
        assert_eq!(distribution_from_version("v1.29.1-gke.1589000"), Some("gke"));
        assert_eq!(distribution_from_version("v1.28.5-eks-5e0fdde"), Some("eks"));
        assert_eq!(distribution_from_version("v1.30.0"), None);
    }

    #[tokio::test]
    async fn highest_accuracy_wins_per_key() {
        let set = DetectorSet::new(vec![
            Box::new(Fixed("distribution", "guess", 10)),
            Box::new(Fixed("distribution", "k3s", 90)),
            Box::new(Fixed("distribution", "late-guess", 50)),
            Box::new(Fixed("region", "eu", 1)),
        ]);
        let metadata = set.detect(&target("http://unused".into())).await;
        assert_eq!(metadata.get("distribution"), Some(&json!("k3s")));
        assert_eq!(metadata.get("region"), Some(&json!("eu")));
    }

    #[tokio::test]
    async fn default_set_reads_the_api_server() {
        let url = serve(&[("/version", VERSION_BODY)], Duration::ZERO).await;
        let metadata = DetectorSet::default().detect(&target(url)).await;

        assert_eq!(metadata.get(metadata_key::VERSION), Some(&json!("v1.30.2+k3s1")));
        assert_eq!(metadata.get(metadata_key::DISTRIBUTION), Some(&json!("k3s")));
        let seen = metadata.get(metadata_key::LAST_SEEN).and_then(Value::as_str).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(seen).is_ok());
    }

    #[tokio::test]
    async fn unreachable_version_endpoint_yields_nothing() {
        let url = serve(&[], Duration::ZERO).await;
        let metadata = DetectorSet::default().detect(&target(url)).await;
        assert!(metadata.get(metadata_key::VERSION).is_none());
        assert!(metadata.get(metadata_key::LAST_SEEN).is_some());
    }
}
