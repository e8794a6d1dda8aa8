//! Feature extraction seam.
//!
//! The face model itself lives outside this crate. `CommandExtractor` talks
//! to it over a process boundary: the image is written to the program's
//! stdin and a JSON array of vectors is read back from stdout, one vector
//! per detected face (`[]` when no face was found).

use std::io::Write;
use std::process::{Command, Stdio};

use crate::faces::vector::FeatureVector;
use crate::images;

/// Error type for feature extraction
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The input could not be decoded as an image.
    #[error("image decode error: {0}")]
    ImageDecode(String),

    #[error("feature extraction failed: {0}")]
    Model(String),
}

/// Produces one feature vector per detected face.
///
/// Implementations must be deterministic for identical input and safe to
/// call from many threads at once.
pub trait FeatureExtractor: Send + Sync {
    /// Extract vectors for every face in `image`. An empty result means no
    /// face was detected.
    fn extract(&self, image: &[u8]) -> Result<Vec<FeatureVector>, ExtractError>;

    /// Length of every vector this extractor produces.
    fn dimensions(&self) -> usize;

    /// Stable model name, recorded in the index header.
    fn model_name(&self) -> &str;

    /// SHA256 of the model name.
    fn model_id(&self) -> [u8; 32] {
        model_id_hash(self.model_name())
    }
}

pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Runs an external encoder program for every image.
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    model_name: String,
    dimensions: usize,
}

impl CommandExtractor {
    /// `argv[0]` is the program, the rest are its arguments.
    pub fn new(argv: &[String], model_name: &str, dimensions: usize) -> Result<Self, ExtractError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExtractError::Model("extractor command is empty".to_string()))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    fn run(&self, image: &[u8]) -> Result<Vec<u8>, ExtractError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExtractError::Model(format!("failed to start {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExtractError::Model("encoder stdin unavailable".to_string()))?;

        // Feed stdin from a scoped thread so a chatty child cannot deadlock
        // against a full stdout pipe.
        let output = std::thread::scope(|scope| {
            let writer = scope.spawn(move || {
                let result = stdin.write_all(image);
                drop(stdin);
                result
            });
            let output = child.wait_with_output();
            let written = writer.join();
            (output, written)
        });

        let (output, written) = output;
        let output =
            output.map_err(|e| ExtractError::Model(format!("encoder did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::Model(format!(
                "encoder exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ExtractError::Model(format!("failed to send image to encoder: {e}")))
            }
            Err(_) => return Err(ExtractError::Model("encoder writer panicked".to_string())),
        }

        Ok(output.stdout)
    }
}

impl FeatureExtractor for CommandExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<FeatureVector>, ExtractError> {
        images::decode(image).map_err(|e| ExtractError::ImageDecode(e.to_string()))?;

        let stdout = self.run(image)?;
        parse_vectors(&stdout, self.dimensions)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Parse the encoder's JSON output and check every vector's length.
pub fn parse_vectors(raw: &[u8], dimensions: usize) -> Result<Vec<FeatureVector>, ExtractError> {
    let vectors: Vec<Vec<f32>> = serde_json::from_slice(raw)
        .map_err(|e| ExtractError::Model(format!("malformed encoder output: {e}")))?;

    vectors
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            if v.len() != dimensions {
                return Err(ExtractError::Model(format!(
                    "face {} has {} dimensions, expected {dimensions}",
                    i + 1,
                    v.len()
                )));
            }
            Ok(FeatureVector::new(v))
        })
        .collect()
}
