//! Model registry and reference decoder models
//!
//! A model reaches the worker either in memory or as a description: a path to
//! a Hugging Face style `config.json` or the config itself. Descriptions are
//! resolved through a closed registry of supported architectures and
//! instantiated with deterministic seeded weights.

pub mod layers;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use shardline_common::{Result, ShardlineError};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelArchitecture {
    Llama,
    Baichuan,
}

impl ModelArchitecture {
    /// Look up an architecture identifier such as `LlamaForCausalLM`
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "LlamaForCausalLM" => Ok(ModelArchitecture::Llama),
            "BaichuanForCausalLM" => Ok(ModelArchitecture::Baichuan),
            other => Err(ShardlineError::UnsupportedModel(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelArchitecture::Llama => "LlamaForCausalLM",
            ModelArchitecture::Baichuan => "BaichuanForCausalLM",
        }
    }

    /// `model_type` value of this architecture's config
    pub fn model_type(&self) -> &'static str {
        match self {
            ModelArchitecture::Llama => "llama",
            ModelArchitecture::Baichuan => "baichuan",
        }
    }
}

impl fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_initializer_range() -> f64 {
    0.02
}

/// Model hyperparameters, read from `config.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,

    pub model_type: String,

    pub hidden_size: usize,

    pub intermediate_size: usize,

    pub num_attention_heads: usize,

    /// Defaults to `num_attention_heads` (no grouped-query attention)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    pub num_hidden_layers: usize,

    pub vocab_size: usize,

    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,

    /// Seed for weight initialisation; equal seeds give equal weights
    #[serde(default)]
    pub seed: u64,
}

impl ModelConfig {
    /// Read a config from a directory holding `config.json`, or from the file itself
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = if path.is_dir() {
            path.join("config.json")
        } else {
            path.to_path_buf()
        };
        let contents = std::fs::read_to_string(&file).map_err(|e| {
            ShardlineError::model(format!("cannot read {}: {}", file.display(), e))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Resolve the first declared architecture through the registry
    pub fn architecture(&self) -> Result<ModelArchitecture> {
        let name = self
            .architectures
            .first()
            .ok_or_else(|| ShardlineError::UnsupportedModel("<no architecture declared>".into()))?;
        ModelArchitecture::from_name(name)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_kv_heads()),
            ("num_hidden_layers", self.num_hidden_layers),
            ("vocab_size", self.vocab_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ShardlineError::model(format!("{} must be greater than zero", name)));
            }
        }

        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ShardlineError::model(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_kv_heads() != 0 {
            return Err(ShardlineError::model(format!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads,
                self.num_kv_heads()
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(ShardlineError::model("rotary embedding needs an even head_dim"));
        }
        Ok(())
    }
}

/// Query/key/value projections of one attention block
#[derive(Debug, Clone)]
pub enum QkvWeights {
    /// Separate `q_proj`, `k_proj` and `v_proj`
    Split { q: Tensor, k: Tensor, v: Tensor },

    /// Baichuan's fused `W_pack`, rows ordered q, k, v
    Packed(Tensor),
}

/// Weights of one decoder layer, linear weights stored `[out, in]`
#[derive(Debug, Clone)]
pub struct DecoderLayerWeights {
    pub input_layernorm: Tensor,
    pub qkv: QkvWeights,
    pub o_proj: Tensor,
    pub post_attention_layernorm: Tensor,
    pub gate_proj: Tensor,
    pub up_proj: Tensor,
    pub down_proj: Tensor,
}

impl DecoderLayerWeights {
    fn tensors(&self) -> Vec<&Tensor> {
        let mut tensors = vec![&self.input_layernorm];
        match &self.qkv {
            QkvWeights::Split { q, k, v } => tensors.extend([q, k, v]),
            QkvWeights::Packed(w_pack) => tensors.push(w_pack),
        }
        tensors.extend([
            &self.o_proj,
            &self.post_attention_layernorm,
            &self.gate_proj,
            &self.up_proj,
            &self.down_proj,
        ]);
        tensors
    }

    fn map(self, f: &impl Fn(Tensor) -> Result<Tensor>) -> Result<Self> {
        Ok(Self {
            input_layernorm: f(self.input_layernorm)?,
            qkv: match self.qkv {
                QkvWeights::Split { q, k, v } => QkvWeights::Split {
                    q: f(q)?,
                    k: f(k)?,
                    v: f(v)?,
                },
                QkvWeights::Packed(w_pack) => QkvWeights::Packed(f(w_pack)?),
            },
            o_proj: f(self.o_proj)?,
            post_attention_layernorm: f(self.post_attention_layernorm)?,
            gate_proj: f(self.gate_proj)?,
            up_proj: f(self.up_proj)?,
            down_proj: f(self.down_proj)?,
        })
    }
}

/// Unsharded decoder-only causal language model
#[derive(Debug, Clone)]
pub struct CausalLm {
    pub config: ModelConfig,
    pub architecture: ModelArchitecture,
    pub embed_tokens: Tensor,
    pub layers: Vec<DecoderLayerWeights>,
    pub norm: Tensor,
    pub lm_head: Tensor,
}

impl CausalLm {
    /// Instantiate the architecture declared by `config` with seeded weights
    pub fn from_config(config: ModelConfig) -> Result<Self> {
        let architecture = config.architecture()?;
        config.validate()?;

        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let q_out = config.num_attention_heads * head_dim;
        let kv_out = config.num_kv_heads() * head_dim;
        let intermediate = config.intermediate_size;
        let std = config.initializer_range;

        debug!(
            "instantiating {} with {} layers, hidden {}",
            architecture, config.num_hidden_layers, hidden
        );

        let mut rng = StdRng::seed_from_u64(config.seed);
        let embed_tokens = random_matrix(&mut rng, config.vocab_size, hidden, std)?;
        let lm_head = random_matrix(&mut rng, config.vocab_size, hidden, std)?;
        let norm = Tensor::ones(hidden, DType::F32, &Device::Cpu)?;

        let layers = (0..config.num_hidden_layers)
            .into_par_iter()
            .map(|idx| -> Result<DecoderLayerWeights> {
                // Each layer draws from its own stream so results do not depend on scheduling
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(idx as u64 + 1));
                let qkv = match architecture {
                    ModelArchitecture::Llama => QkvWeights::Split {
                        q: random_matrix(&mut rng, q_out, hidden, std)?,
                        k: random_matrix(&mut rng, kv_out, hidden, std)?,
                        v: random_matrix(&mut rng, kv_out, hidden, std)?,
                    },
                    ModelArchitecture::Baichuan => {
                        QkvWeights::Packed(random_matrix(&mut rng, q_out + 2 * kv_out, hidden, std)?)
                    }
                };

                Ok(DecoderLayerWeights {
                    input_layernorm: Tensor::ones(hidden, DType::F32, &Device::Cpu)?,
                    qkv,
                    o_proj: random_matrix(&mut rng, hidden, q_out, std)?,
                    post_attention_layernorm: Tensor::ones(hidden, DType::F32, &Device::Cpu)?,
                    gate_proj: random_matrix(&mut rng, intermediate, hidden, std)?,
                    up_proj: random_matrix(&mut rng, intermediate, hidden, std)?,
                    down_proj: random_matrix(&mut rng, hidden, intermediate, std)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            architecture,
            embed_tokens,
            layers,
            norm,
            lm_head,
        })
    }

    /// Cast and move every weight
    pub fn to(self, device: &Device, dtype: DType) -> Result<Self> {
        let place = |t: Tensor| -> Result<Tensor> { Ok(t.to_dtype(dtype)?.to_device(device)?) };

        Ok(Self {
            embed_tokens: place(self.embed_tokens)?,
            layers: self
                .layers
                .into_iter()
                .map(|layer| layer.map(&place))
                .collect::<Result<Vec<_>>>()?,
            norm: place(self.norm)?,
            lm_head: place(self.lm_head)?,
            ..self
        })
    }

    pub fn dtype(&self) -> DType {
        self.embed_tokens.dtype()
    }

    /// Bytes held by all weights
    pub fn weight_bytes(&self) -> usize {
        let layer_bytes: usize = self
            .layers
            .iter()
            .flat_map(|layer| layer.tensors())
            .map(tensor_bytes)
            .sum();
        layer_bytes
            + tensor_bytes(&self.embed_tokens)
            + tensor_bytes(&self.norm)
            + tensor_bytes(&self.lm_head)
    }
}

/// Bytes held by a tensor's elements
pub fn tensor_bytes(tensor: &Tensor) -> usize {
    tensor.elem_count() * tensor.dtype().size_in_bytes()
}

/// Uniform init with standard deviation `std`
fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize, std: f64) -> Result<Tensor> {
    let bound = (std * 3f64.sqrt()) as f32;
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..=bound))
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), &Device::Cpu)?)
}

/// Where init-model gets its model from
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// Already constructed model
    Model(Box<CausalLm>),

    /// Directory holding `config.json`, or the file itself
    Locator(PathBuf),

    /// Inline model description
    Config(ModelConfig),
}

impl ModelSource {
    /// Produce the model, failing with `UnsupportedModel` for unknown architectures
    ///
    /// The architecture is checked before any weight is created.
    pub fn resolve(self) -> Result<CausalLm> {
        let config = match self {
            ModelSource::Model(model) => return Ok(*model),
            ModelSource::Locator(path) => ModelConfig::from_path(&path)?,
            ModelSource::Config(config) => config,
        };

        let architecture = config.architecture()?;
        info!("resolved architecture {} ({})", architecture, config.model_type);
        CausalLm::from_config(config)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn tiny_config(architecture: &str) -> ModelConfig {
        ModelConfig {
            architectures: vec![architecture.to_string()],
            model_type: if architecture.starts_with("Baichuan") {
                "baichuan".into()
            } else {
                "llama".into()
            },
            hidden_size: 64,
            intermediate_size: 128,
            num_attention_heads: 4,
            num_key_value_heads: None,
            num_hidden_layers: 2,
            vocab_size: 50,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            max_position_embeddings: 512,
            initializer_range: 0.02,
            seed: 7,
        }
    }

    #[test]
    fn test_registry() {
        assert_eq!(
            ModelArchitecture::from_name("BaichuanForCausalLM").unwrap(),
            ModelArchitecture::Baichuan
        );
        assert!(matches!(
            ModelArchitecture::from_name("GPT2LMHeadModel"),
            Err(ShardlineError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn test_seeded_init_is_deterministic() {
        let a = CausalLm::from_config(tiny_config("LlamaForCausalLM")).unwrap();
        let b = CausalLm::from_config(tiny_config("LlamaForCausalLM")).unwrap();

        let a_down = a.layers[1].down_proj.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b_down = b.layers[1].down_proj.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a_down, b_down);
        assert_eq!(a.layers[0].o_proj.dims(), &[64, 64]);
    }

    #[test]
    fn test_baichuan_packs_qkv() {
        let model = CausalLm::from_config(tiny_config("BaichuanForCausalLM")).unwrap();
        match &model.layers[0].qkv {
            QkvWeights::Packed(w_pack) => assert_eq!(w_pack.dims(), &[192, 64]),
            QkvWeights::Split { .. } => panic!("expected packed projection"),
        }
    }

    #[test]
    fn test_locator_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("config.json")).unwrap();
        let config = serde_json::to_string(&tiny_config("LlamaForCausalLM")).unwrap();
        file.write_all(config.as_bytes()).unwrap();

        let model = ModelSource::Locator(dir.path().to_path_buf()).resolve().unwrap();
        assert_eq!(model.architecture, ModelArchitecture::Llama);
        assert_eq!(model.layers.len(), 2);

        let mut unsupported = tiny_config("LlamaForCausalLM");
        unsupported.architectures = vec!["MptForCausalLM".into()];
        let err = ModelSource::Config(unsupported).resolve().unwrap_err();
        assert!(err.is_resolution());
    }

    #[test]
    fn test_to_casts_every_weight() {
        let model = CausalLm::from_config(tiny_config("LlamaForCausalLM")).unwrap();
        let full = model.weight_bytes();
        let half = model.to(&Device::Cpu, DType::F16).unwrap();
        assert_eq!(half.dtype(), DType::F16);
        assert_eq!(half.weight_bytes() * 2, full);
    }
}
