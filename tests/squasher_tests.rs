//! Tests for the image squashing pipeline.
//!
//! Uses an in-memory registry plus recording extract/pack helpers to
//! validate manifest selection, layer ordering, working-tree hygiene,
//! and failure propagation without touching the network.

use async_trait::async_trait;
use emberbox::{
    Error, FetchedImage, ImageReference, ImageRegistry, LayerHandle, LayerSquasher,
    ManifestDescriptor, PlatformVariant, Result, RuntimeConfig, SquashRequest, TarballExtractor,
    TreePacker,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// =============================================================================
// Doubles
// =============================================================================

#[derive(Clone)]
struct FakeLayer {
    digest: String,
    media_type: String,
    content: String,
}

impl FakeLayer {
    fn new(id: &str) -> Self {
        Self {
            digest: format!("shafake1:{id}_comp"),
            media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".to_string(),
            content: format!("layerIs:{id}"),
        }
    }

    fn with_media_type(mut self, media_type: &str) -> Self {
        self.media_type = media_type.to_string();
        self
    }
}

struct FakeImage {
    layers: Vec<FakeLayer>,
    config: RuntimeConfig,
}

/// Registry double serving a fixed index and per-digest images.
#[derive(Default)]
struct FakeRegistry {
    index: Vec<ManifestDescriptor>,
    images: std::collections::HashMap<String, FakeImage>,
    requested: Mutex<Vec<String>>,
}

impl FakeRegistry {
    fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageRegistry for FakeRegistry {
    async fn fetch_index(&self, _reference: &ImageReference) -> Result<Vec<ManifestDescriptor>> {
        Ok(self.index.clone())
    }

    async fn fetch_image(
        &self,
        _reference: &ImageReference,
        digest: &str,
    ) -> Result<FetchedImage> {
        self.requested.lock().unwrap().push(digest.to_string());
        let image = self.images.get(digest).expect("unexpected digest requested");
        Ok(FetchedImage {
            digest: digest.to_string(),
            layers: image
                .layers
                .iter()
                .map(|layer| {
                    LayerHandle::from_bytes(
                        &layer.digest,
                        &layer.media_type,
                        layer.content.clone().into_bytes(),
                    )
                })
                .collect(),
            config: image.config.clone(),
        })
    }
}

/// Extractor double recording layer content and target directory.
#[derive(Default, Clone)]
struct RecordingExtractor {
    extracted: Arc<Mutex<Vec<(String, PathBuf)>>>,
    fail_on: Option<String>,
}

impl TarballExtractor for RecordingExtractor {
    fn extract(&self, archive: &mut (dyn Read + Send), dir: &Path) -> Result<()> {
        let mut content = Vec::new();
        archive.read_to_end(&mut content)?;
        let content = String::from_utf8_lossy(&content).into_owned();

        if self.fail_on.as_deref() == Some(content.as_str()) {
            return Err(Error::Io(std::io::Error::other("scripted extract failure")));
        }
        self.extracted
            .lock()
            .unwrap()
            .push((content, dir.to_path_buf()));
        Ok(())
    }
}

/// Packer double recording (dir, output) pairs.
#[derive(Default, Clone)]
struct RecordingPacker {
    packed: Arc<Mutex<Vec<(PathBuf, PathBuf)>>>,
}

#[async_trait]
impl TreePacker for RecordingPacker {
    async fn pack(&self, dir: &Path, output: &Path) -> Result<()> {
        self.packed
            .lock()
            .unwrap()
            .push((dir.to_path_buf(), output.to_path_buf()));
        Ok(())
    }
}

struct BrokenPacker;

#[async_trait]
impl TreePacker for BrokenPacker {
    fn preflight(&self) -> Result<()> {
        Err(Error::ToolMissing("mksquashfs"))
    }

    async fn pack(&self, _dir: &Path, _output: &Path) -> Result<()> {
        unreachable!("preflight refused")
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn descriptor(os: &str, architecture: &str, variant: &str, digest: &str) -> ManifestDescriptor {
    ManifestDescriptor {
        digest: digest.to_string(),
        os: os.to_string(),
        architecture: architecture.to_string(),
        variant: variant.to_string(),
    }
}

fn sample_config() -> RuntimeConfig {
    RuntimeConfig {
        entrypoint: vec!["/docker-entrypoint.sh".into()],
        cmd: vec!["redis-server".into()],
        env: vec!["PATH=/usr/local/bin".into()],
        workdir: "/data".into(),
    }
}

fn four_layer_image() -> FakeImage {
    FakeImage {
        layers: (1..=4).map(|i| FakeLayer::new(&format!("layer{i}"))).collect(),
        config: sample_config(),
    }
}

struct Harness {
    registry: Arc<FakeRegistry>,
    extractor: RecordingExtractor,
    packer: RecordingPacker,
    squasher: LayerSquasher,
}

fn harness(registry: FakeRegistry, extractor: RecordingExtractor) -> Harness {
    let registry = Arc::new(registry);
    let packer = RecordingPacker::default();
    let squasher = LayerSquasher::with_helpers(
        Arc::clone(&registry) as Arc<dyn ImageRegistry>,
        Arc::new(extractor.clone()),
        Arc::new(packer.clone()),
    );
    Harness {
        registry,
        extractor,
        packer,
        squasher,
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn multi_arch_index_on_x86_64_selects_amd64() {
    let mut registry = FakeRegistry {
        index: vec![
            descriptor("linux", "amd64", "", "shafake1:A"),
            descriptor("linux", "arm64", "v8", "shafake1:B"),
            descriptor("windows", "amd64", "", "shafake1:W"),
        ],
        ..Default::default()
    };
    registry.images.insert("shafake1:A".into(), four_layer_image());

    let temp = tempfile::tempdir().unwrap();
    let output = temp.path().join("out").join("file.sqsh");
    std::fs::create_dir_all(output.parent().unwrap()).unwrap();

    let h = harness(registry, RecordingExtractor::default());
    let request = SquashRequest::default()
        .with_image("redis", "latest")
        .with_platform(PlatformVariant::X86_64)
        .with_temp_dir(temp.path());

    let (path, config) = h.squasher.pull_and_squash(&request, &output).await.unwrap();

    assert_eq!(h.registry.requested(), vec!["shafake1:A"]);
    assert_eq!(path, output);
    assert_eq!(config, sample_config());

    // Layers extracted in declared order, all into the working tree.
    let workdir = temp.path().join("squashwork");
    let extracted = h.extractor.extracted.lock().unwrap().clone();
    assert_eq!(
        extracted.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>(),
        vec![
            "layerIs:layer1",
            "layerIs:layer2",
            "layerIs:layer3",
            "layerIs:layer4"
        ]
    );
    assert!(extracted.iter().all(|(_, dir)| *dir == workdir));

    // Pack ran once, over the working tree, into the requested output.
    assert_eq!(
        h.packer.packed.lock().unwrap().clone(),
        vec![(workdir.clone(), output)]
    );

    // Working tree is gone on success.
    assert!(!workdir.exists());
}

#[tokio::test]
async fn aarch64_prefers_armv7_over_armv5() {
    let mut registry = FakeRegistry {
        index: vec![
            descriptor("linux", "arm", "v7", "shafake1:v7"),
            descriptor("linux", "arm", "v5", "shafake1:v5"),
        ],
        ..Default::default()
    };
    registry.images.insert("shafake1:v7".into(), four_layer_image());

    let temp = tempfile::tempdir().unwrap();
    let output = temp.path().join("file.sqsh");

    let h = harness(registry, RecordingExtractor::default());
    let request = SquashRequest::default()
        .with_platform(PlatformVariant::Aarch64)
        .with_temp_dir(temp.path());

    h.squasher.pull_and_squash(&request, &output).await.unwrap();

    assert_eq!(h.registry.requested(), vec!["shafake1:v7"]);
}

#[tokio::test]
async fn no_linux_manifest_for_platform_fails_before_fetching_layers() {
    let registry = FakeRegistry {
        index: vec![descriptor("windows", "amd64", "", "shafake1:W")],
        ..Default::default()
    };

    let temp = tempfile::tempdir().unwrap();
    let h = harness(registry, RecordingExtractor::default());
    let request = SquashRequest::default()
        .with_platform(PlatformVariant::X86_64)
        .with_temp_dir(temp.path());

    let err = h
        .squasher
        .pull_and_squash(&request, &temp.path().join("o.sqsh"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoSuitableManifest { .. }));
    assert!(h.registry.requested().is_empty());
    assert!(h.packer.packed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_layer_media_type_aborts_without_packing() {
    let mut registry = FakeRegistry {
        index: vec![descriptor("linux", "amd64", "", "shafake1:A")],
        ..Default::default()
    };
    registry.images.insert(
        "shafake1:A".into(),
        FakeImage {
            layers: vec![
                FakeLayer::new("layer1"),
                FakeLayer::new("layer2")
                    .with_media_type("application/vnd.oci.image.layer.v1.tar+zstd"),
            ],
            config: sample_config(),
        },
    );

    let temp = tempfile::tempdir().unwrap();
    let h = harness(registry, RecordingExtractor::default());
    let request = SquashRequest::default()
        .with_platform(PlatformVariant::X86_64)
        .with_temp_dir(temp.path());

    let err = h
        .squasher
        .pull_and_squash(&request, &temp.path().join("o.sqsh"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnsupportedLayer { .. }));
    assert!(h.packer.packed.lock().unwrap().is_empty());
    assert!(
        !temp.path().join("squashwork").exists(),
        "working tree must be removed on failure"
    );
}

#[tokio::test]
async fn extraction_failure_aborts_and_cleans_up() {
    let mut registry = FakeRegistry {
        index: vec![descriptor("linux", "amd64", "", "shafake1:A")],
        ..Default::default()
    };
    registry.images.insert("shafake1:A".into(), four_layer_image());

    let temp = tempfile::tempdir().unwrap();
    let extractor = RecordingExtractor {
        fail_on: Some("layerIs:layer2".to_string()),
        ..Default::default()
    };
    let h = harness(registry, extractor);
    let request = SquashRequest::default()
        .with_platform(PlatformVariant::X86_64)
        .with_temp_dir(temp.path());

    let err = h
        .squasher
        .pull_and_squash(&request, &temp.path().join("o.sqsh"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Io(_)));
    // layer1 went through; layer3/layer4 never started.
    assert_eq!(h.extractor.extracted.lock().unwrap().len(), 1);
    assert!(h.packer.packed.lock().unwrap().is_empty());
    assert!(!temp.path().join("squashwork").exists());
}

#[tokio::test]
async fn packer_preflight_failure_stops_before_any_registry_work() {
    let registry = Arc::new(FakeRegistry {
        index: vec![descriptor("linux", "amd64", "", "shafake1:A")],
        ..Default::default()
    });
    let squasher = LayerSquasher::with_helpers(
        Arc::clone(&registry) as Arc<dyn ImageRegistry>,
        Arc::new(RecordingExtractor::default()),
        Arc::new(BrokenPacker),
    );

    let temp = tempfile::tempdir().unwrap();
    let request = SquashRequest::default().with_temp_dir(temp.path());
    let err = squasher
        .pull_and_squash(&request, &temp.path().join("o.sqsh"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ToolMissing("mksquashfs")));
    assert!(registry.requested().is_empty());
}

#[tokio::test]
async fn sha256_layer_digests_are_verified() {
    use sha2::{Digest, Sha256};

    let content = "layerIs:layer1".to_string();
    let good_digest = format!("sha256:{:x}", Sha256::digest(content.as_bytes()));

    let mut registry = FakeRegistry {
        index: vec![descriptor("linux", "amd64", "", "shafake1:A")],
        ..Default::default()
    };
    registry.images.insert(
        "shafake1:A".into(),
        FakeImage {
            layers: vec![FakeLayer {
                digest: good_digest,
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
                content,
            }],
            config: RuntimeConfig::default(),
        },
    );

    let temp = tempfile::tempdir().unwrap();
    let h = harness(registry, RecordingExtractor::default());
    let request = SquashRequest::default()
        .with_platform(PlatformVariant::X86_64)
        .with_temp_dir(temp.path());

    h.squasher
        .pull_and_squash(&request, &temp.path().join("o.sqsh"))
        .await
        .unwrap();

    // Now corrupt the digest and expect a mismatch.
    let mut registry = FakeRegistry {
        index: vec![descriptor("linux", "amd64", "", "shafake1:A")],
        ..Default::default()
    };
    registry.images.insert(
        "shafake1:A".into(),
        FakeImage {
            layers: vec![FakeLayer {
                digest: format!("sha256:{:x}", Sha256::digest(b"something else")),
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
                content: "layerIs:layer1".into(),
            }],
            config: RuntimeConfig::default(),
        },
    );
    let h = harness(registry, RecordingExtractor::default());
    let err = h
        .squasher
        .pull_and_squash(&request, &temp.path().join("o.sqsh"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LayerDigestMismatch { .. }));
}
