use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use tensorflow::{
    Graph, ImportGraphDefOptions, Operation, Session, SessionOptions, SessionRunArgs, Tensor,
};

use crate::vocab::Vocabulary;

pub const IMAGE_SIZE: u32 = 224;
pub const EMBED_SIZE: u64 = 512;
pub const HIDDEN_SIZE: u64 = 512;
pub const MAX_CAPTION_LEN: usize = 20;

// ImageNet channel statistics, matching how the encoder was trained.
const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

// Encoder graph interface.
const ENCODER_INPUT: &str = "image";
const ENCODER_OUTPUT: &str = "features";

// Decoder graph interface: an embedding lookup plus one recurrent step.
const DECODER_TOKEN_ID: &str = "token_id";
const DECODER_TOKEN_EMBEDDING: &str = "token_embedding";
const DECODER_INPUT: &str = "input_embedding";
const DECODER_STATE_H: &str = "state_h";
const DECODER_STATE_C: &str = "state_c";
const DECODER_LOGITS: &str = "logits";
const DECODER_STATE_H_OUT: &str = "state_h_out";
const DECODER_STATE_C_OUT: &str = "state_c_out";

struct FrozenGraph {
    graph: Graph,
    session: Session,
}

impl FrozenGraph {
    fn load(path: &Path) -> Result<Self> {
        let mut graph_file = File::open(path)
            .with_context(|| format!("failed to open graph file {}", path.display()))?;
        let mut graph_bytes = Vec::new();
        graph_file.read_to_end(&mut graph_bytes)?;

        let mut graph = Graph::new();
        graph
            .import_graph_def(&graph_bytes, &ImportGraphDefOptions::new())
            .with_context(|| format!("failed to import graph {}", path.display()))?;
        let session =
            Session::new(&SessionOptions::new(), &graph).context("failed to create session")?;

        Ok(Self { graph, session })
    }

    fn op(&self, name: &str) -> Result<Operation> {
        self.graph
            .operation_by_name(name)
            .map_err(|_| anyhow!("failed to look up operation {name}"))?
            .ok_or_else(|| anyhow!("operation {name} not found in graph"))
    }
}

struct LstmState {
    h: Tensor<f32>,
    c: Tensor<f32>,
}

impl LstmState {
    fn zeroed() -> Self {
        Self {
            h: Tensor::new(&[1, HIDDEN_SIZE]),
            c: Tensor::new(&[1, HIDDEN_SIZE]),
        }
    }
}

/// Pretrained encoder-decoder captioning network. The encoder maps a
/// normalized image to a feature embedding; the decoder is driven one
/// step at a time from Rust, greedy-sampling a token per step.
pub struct Captioner {
    encoder: FrozenGraph,
    decoder: FrozenGraph,
    vocab: Vocabulary,
}

impl Captioner {
    pub fn new(encoder_path: &Path, decoder_path: &Path, vocab: Vocabulary) -> Result<Self> {
        let encoder = FrozenGraph::load(encoder_path)?;
        let decoder = FrozenGraph::load(decoder_path)?;
        tracing::info!(
            "loaded encoder {} and decoder {}",
            encoder_path.display(),
            decoder_path.display()
        );
        Ok(Self {
            encoder,
            decoder,
            vocab,
        })
    }

    /// Produce a natural-language caption for the image at `path`.
    pub fn caption(&self, path: &Path) -> Result<String> {
        let input = self.preprocess(path)?;
        let features = self.encode(&input)?;
        let ids = self.sample(features)?;
        Ok(self.vocab.clean_sentence(&ids))
    }

    fn preprocess(&self, path: &Path) -> Result<Tensor<f32>> {
        let img = image::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?;
        let pixels = normalize_pixels(&img);

        let mut tensor = Tensor::new(&[1, IMAGE_SIZE as u64, IMAGE_SIZE as u64, 3]);
        tensor.copy_from_slice(&pixels);
        Ok(tensor)
    }

    fn encode(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let input_op = self.encoder.op(ENCODER_INPUT)?;
        let output_op = self.encoder.op(ENCODER_OUTPUT)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_op, 0, input);
        let features = args.request_fetch(&output_op, 0);
        self.encoder
            .session
            .run(&mut args)
            .context("encoder forward pass failed")?;

        let features: Tensor<f32> = args.fetch(features)?;
        if features.dims() != [1, EMBED_SIZE] {
            return Err(anyhow!(
                "encoder produced features of shape {:?}, expected [1, {EMBED_SIZE}]",
                features.dims()
            ));
        }
        Ok(features)
    }

    /// Greedy autoregressive decoding. The first step feeds the image
    /// features in place of a token embedding with zeroed states, as
    /// the decoder was trained; later steps feed the embedding of the
    /// previously emitted token. Always terminates: stops on `<end>`
    /// or after `MAX_CAPTION_LEN` steps.
    fn sample(&self, features: Tensor<f32>) -> Result<Vec<i64>> {
        let mut state = LstmState::zeroed();
        let mut input = features;
        let mut ids = Vec::new();

        for _ in 0..MAX_CAPTION_LEN {
            let (logits, next_state) = self.decode_step(&input, &state)?;
            let id = argmax(&logits) as i64;
            ids.push(id);
            state = next_state;

            if id == self.vocab.end_id() {
                break;
            }
            input = self.embed_token(id)?;
        }
        Ok(ids)
    }

    fn decode_step(
        &self,
        input: &Tensor<f32>,
        state: &LstmState,
    ) -> Result<(Tensor<f32>, LstmState)> {
        let input_op = self.decoder.op(DECODER_INPUT)?;
        let state_h_op = self.decoder.op(DECODER_STATE_H)?;
        let state_c_op = self.decoder.op(DECODER_STATE_C)?;
        let logits_op = self.decoder.op(DECODER_LOGITS)?;
        let state_h_out_op = self.decoder.op(DECODER_STATE_H_OUT)?;
        let state_c_out_op = self.decoder.op(DECODER_STATE_C_OUT)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_op, 0, input);
        args.add_feed(&state_h_op, 0, &state.h);
        args.add_feed(&state_c_op, 0, &state.c);
        let logits = args.request_fetch(&logits_op, 0);
        let state_h = args.request_fetch(&state_h_out_op, 0);
        let state_c = args.request_fetch(&state_c_out_op, 0);
        self.decoder
            .session
            .run(&mut args)
            .context("decoder step failed")?;

        let next_state = LstmState {
            h: args.fetch(state_h)?,
            c: args.fetch(state_c)?,
        };
        Ok((args.fetch(logits)?, next_state))
    }

    fn embed_token(&self, id: i64) -> Result<Tensor<f32>> {
        let id_op = self.decoder.op(DECODER_TOKEN_ID)?;
        let embedding_op = self.decoder.op(DECODER_TOKEN_EMBEDDING)?;

        let mut ids: Tensor<i64> = Tensor::new(&[1]);
        ids[0] = id;

        let mut args = SessionRunArgs::new();
        args.add_feed(&id_op, 0, &ids);
        let embedding = args.request_fetch(&embedding_op, 0);
        self.decoder
            .session
            .run(&mut args)
            .context("embedding lookup failed")?;
        Ok(args.fetch(embedding)?)
    }
}

/// Resize to exactly 224x224 RGB and normalize with the ImageNet
/// channel statistics. Row-major, channels innermost.
fn normalize_pixels(img: &DynamicImage) -> Vec<f32> {
    let resized = img
        .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle)
        .to_rgb8();

    let mut flat = Vec::with_capacity((IMAGE_SIZE * IMAGE_SIZE * 3) as usize);
    for pixel in resized.pixels() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            flat.push((value - CHANNEL_MEAN[channel]) / CHANNEL_STD[channel]);
        }
    }
    flat
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &value) in values.iter().enumerate() {
        if value > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn normalized_pixels_have_the_expected_shape() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
            64,
            48,
            Rgb::<u8>([128, 128, 128]),
        ));
        let pixels = normalize_pixels(&img);
        assert_eq!(pixels.len(), (IMAGE_SIZE * IMAGE_SIZE * 3) as usize);
    }

    #[test]
    fn normalization_applies_channel_statistics() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
            IMAGE_SIZE,
            IMAGE_SIZE,
            Rgb::<u8>([255, 0, 128]),
        ));
        let pixels = normalize_pixels(&img);

        let expected_r = (1.0 - CHANNEL_MEAN[0]) / CHANNEL_STD[0];
        let expected_g = (0.0 - CHANNEL_MEAN[1]) / CHANNEL_STD[1];
        let expected_b = (128.0 / 255.0 - CHANNEL_MEAN[2]) / CHANNEL_STD[2];
        assert!((pixels[0] - expected_r).abs() < 1e-5);
        assert!((pixels[1] - expected_g).abs() < 1e-5);
        assert!((pixels[2] - expected_b).abs() < 1e-5);
    }

    #[test]
    fn argmax_picks_the_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[0.5, 0.5]), 0);
        assert_eq!(argmax(&[]), 0);
    }
}
