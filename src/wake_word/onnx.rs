//! openWakeWord models through ONNX Runtime
//!
//! Three graphs run in sequence: raw 16 kHz audio to mel frames, a window of
//! mel frames to one speech embedding, and the last embeddings to a
//! per-phrase score. Audio arrives in capture frames and is regrouped into
//! 80 ms chunks; between chunks the last score is repeated.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, Array4};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::model::{BurstModel, FALLBACK_MODEL, ModelLoader, WakeWordModel, model_name_for};
use crate::voice::AudioFrame;
use crate::{Error, Result};

/// Samples per inference chunk (80 ms at 16 kHz)
const CHUNK_SAMPLES: usize = 1280;
const MEL_BINS: usize = 32;
/// Mel frames per embedding
const EMBEDDING_WINDOW: usize = 76;
const EMBEDDING_DIM: usize = 96;
/// Embeddings per classification
const CLASSIFICATION_FRAMES: usize = 16;
const MAX_MEL_FRAMES: usize = EMBEDDING_WINDOW * 2;
const MAX_EMBEDDINGS: usize = 120;
/// Leading classifier outputs forced to zero
const WARMUP_PREDICTIONS: usize = 5;

pub const MELSPECTROGRAM_FILE: &str = "melspectrogram.onnx";
pub const EMBEDDING_FILE: &str = "embedding_model.onnx";

/// Loads openWakeWord models from a directory
///
/// The directory holds `melspectrogram.onnx`, `embedding_model.onnx` and one
/// `<model>.onnx` classifier per phrase in
/// [`AVAILABLE_WAKE_WORDS`](super::AVAILABLE_WAKE_WORDS). With `fallback`
/// set, a model that cannot be loaded is replaced by the energy
/// [`BurstModel`] and a warning is logged.
#[derive(Debug, Clone)]
pub struct OnnxModels {
    dir: PathBuf,
    fallback: bool,
}

impl OnnxModels {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fallback: false,
        }
    }

    /// Substitute the energy model when loading fails
    #[must_use]
    pub const fn with_fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ModelLoader for OnnxModels {
    fn load(&self, wake_word: &str) -> Result<Box<dyn WakeWordModel>> {
        if wake_word.trim().is_empty() {
            return Err(Error::DetectionFault("wake word is empty".to_string()));
        }

        let model = model_name_for(wake_word).unwrap_or_else(|| {
            tracing::warn!(
                wake_word,
                fallback = FALLBACK_MODEL,
                "no model for wake word, using fallback"
            );
            FALLBACK_MODEL
        });

        match OpenWakeWordModel::load(&self.dir, model) {
            Ok(loaded) => {
                tracing::info!(wake_word, model, dir = %self.dir.display(), "wake word model loaded");
                Ok(Box::new(loaded))
            }
            Err(e) if self.fallback => {
                tracing::warn!(
                    wake_word,
                    model,
                    error = %e,
                    "wake word model unavailable, falling back to energy detection"
                );
                Ok(Box::new(BurstModel::new(model)))
            }
            Err(e) => Err(e),
        }
    }
}

fn fault<E: std::fmt::Display>(stage: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::DetectionFault(format!("{stage}: {e}"))
}

fn load_fault<E: std::fmt::Display>(path: &Path) -> impl Fn(E) -> Error + '_ {
    move |e| Error::DetectionFault(format!("failed to load {}: {e}", path.display()))
}

fn open_session(path: &Path) -> Result<Session> {
    Session::builder()
        .map_err(load_fault(path))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(load_fault(path))?
        .with_intra_threads(1)
        .map_err(load_fault(path))?
        .with_inter_threads(1)
        .map_err(load_fault(path))?
        .commit_from_file(path)
        .map_err(load_fault(path))
}

/// One phrase classifier with its shared feature graphs
pub struct OpenWakeWordModel {
    name: String,
    melspectrogram: Session,
    embedding: Session,
    classifier: Session,
    pending: Vec<i16>,
    mel_frames: VecDeque<[f32; MEL_BINS]>,
    embeddings: VecDeque<[f32; EMBEDDING_DIM]>,
    predictions: usize,
    score: f32,
}

impl OpenWakeWordModel {
    /// Load the feature graphs and the `<model>.onnx` classifier from `dir`
    ///
    /// # Errors
    ///
    /// Returns `Error::DetectionFault` if a file is missing or not a valid
    /// model
    pub fn load(dir: &Path, model: &str) -> Result<Self> {
        let [classifier, melspectrogram, embedding] = [
            dir.join(format!("{model}.onnx")),
            dir.join(MELSPECTROGRAM_FILE),
            dir.join(EMBEDDING_FILE),
        ];
        for path in [&classifier, &melspectrogram, &embedding] {
            if !path.is_file() {
                return Err(Error::DetectionFault(format!(
                    "model file not found: {}",
                    path.display()
                )));
            }
        }

        let classifier = open_session(&classifier)?;
        let melspectrogram = open_session(&melspectrogram)?;
        let embedding = open_session(&embedding)?;

        Ok(Self {
            name: model.to_string(),
            melspectrogram,
            embedding,
            classifier,
            pending: Vec::with_capacity(CHUNK_SAMPLES * 2),
            mel_frames: VecDeque::with_capacity(MAX_MEL_FRAMES),
            embeddings: VecDeque::with_capacity(MAX_EMBEDDINGS),
            predictions: 0,
            score: 0.0,
        })
    }

    fn process_chunk(&mut self, chunk: &[i16]) -> Result<()> {
        self.push_mel_frames(chunk)?;
        if self.mel_frames.len() < EMBEDDING_WINDOW {
            return Ok(());
        }

        self.push_embedding()?;
        if self.embeddings.len() < CLASSIFICATION_FRAMES {
            return Ok(());
        }

        let score = self.classify()?;
        self.predictions += 1;
        self.score = if self.predictions <= WARMUP_PREDICTIONS {
            0.0
        } else {
            score
        };
        Ok(())
    }

    fn push_mel_frames(&mut self, chunk: &[i16]) -> Result<()> {
        // The graph expects unnormalized sample values
        let samples: Vec<f32> = chunk.iter().map(|&s| f32::from(s)).collect();
        let input = Array2::from_shape_vec((1, samples.len()), samples).map_err(fault("mel input"))?;
        let tensor = Tensor::from_array(input).map_err(fault("mel input"))?;

        let outputs = self
            .melspectrogram
            .run(ort::inputs![tensor])
            .map_err(fault("melspectrogram"))?;
        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(fault("melspectrogram output"))?;

        let values: Vec<f32> = output.iter().copied().collect();
        for bins in values.chunks_exact(MEL_BINS) {
            let mut frame = [0.0_f32; MEL_BINS];
            for (slot, value) in frame.iter_mut().zip(bins) {
                *slot = value / 10.0 + 2.0;
            }
            if self.mel_frames.len() == MAX_MEL_FRAMES {
                self.mel_frames.pop_front();
            }
            self.mel_frames.push_back(frame);
        }
        Ok(())
    }

    fn push_embedding(&mut self) -> Result<()> {
        let start = self.mel_frames.len() - EMBEDDING_WINDOW;
        let window: Vec<f32> = self
            .mel_frames
            .range(start..)
            .flat_map(|frame| frame.iter().copied())
            .collect();
        let input = Array4::from_shape_vec((1, EMBEDDING_WINDOW, MEL_BINS, 1), window)
            .map_err(fault("embedding input"))?;
        let tensor = Tensor::from_array(input).map_err(fault("embedding input"))?;

        let outputs = self
            .embedding
            .run(ort::inputs![tensor])
            .map_err(fault("embedding"))?;
        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(fault("embedding output"))?;

        let values: Vec<f32> = output.iter().copied().collect();
        for dims in values.chunks_exact(EMBEDDING_DIM) {
            let mut embedding = [0.0_f32; EMBEDDING_DIM];
            embedding.copy_from_slice(dims);
            if self.embeddings.len() == MAX_EMBEDDINGS {
                self.embeddings.pop_front();
            }
            self.embeddings.push_back(embedding);
        }
        Ok(())
    }

    fn classify(&mut self) -> Result<f32> {
        let start = self.embeddings.len() - CLASSIFICATION_FRAMES;
        let features: Vec<f32> = self
            .embeddings
            .range(start..)
            .flat_map(|embedding| embedding.iter().copied())
            .collect();
        let input = Array3::from_shape_vec((1, CLASSIFICATION_FRAMES, EMBEDDING_DIM), features)
            .map_err(fault("classifier input"))?;
        let tensor = Tensor::from_array(input).map_err(fault("classifier input"))?;

        let outputs = self
            .classifier
            .run(ort::inputs![tensor])
            .map_err(fault("classifier"))?;
        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(fault("classifier output"))?;

        output
            .iter()
            .next()
            .copied()
            .ok_or_else(|| Error::DetectionFault("classifier returned no score".to_string()))
    }
}

impl WakeWordModel for OpenWakeWordModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&mut self, frame: &AudioFrame) -> Result<f32> {
        self.pending.extend_from_slice(frame.samples());
        while self.pending.len() >= CHUNK_SAMPLES {
            let chunk: Vec<i16> = self.pending.drain(..CHUNK_SAMPLES).collect();
            self.process_chunk(&chunk)?;
        }
        Ok(self.score)
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.mel_frames.clear();
        self.embeddings.clear();
        self.predictions = 0;
        self.score = 0.0;
    }
}
