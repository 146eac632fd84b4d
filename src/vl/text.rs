//! Text decoder: grouped-query attention with per-layer KV caches, SwiGLU
//! MLPs, RMSNorm, and multi-axis rotary position encoding.
//!
//! KV caches sit behind mutexes so a loaded model can be shared across
//! threads; the generation lock on the owning handle guarantees only one
//! generation mutates them at a time.

use crate::vl::attention::{
    MultiAxisRope, apply_multimodal_rope, repeat_kv, scaled_dot_product_attention,
};
use crate::vl::config::Qwen2VlConfig;
use candle_core::{Result, Tensor};
use candle_nn::{
    Embedding, Linear, Module, VarBuilder, embedding, kv_cache::KvCache, linear, linear_no_bias,
    rms_norm,
};
use std::sync::Mutex;

#[derive(Debug)]
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(cfg: &Qwen2VlConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("mlp.gate_proj"))?,
            up_proj: linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("mlp.up_proj"))?,
            down_proj: linear_no_bias(cfg.intermediate_size, cfg.hidden_size, vb.pp("mlp.down_proj"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(xs)?)?;
        let up = self.up_proj.forward(xs)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    num_kv_groups: usize,
    head_dim: usize,
    scaling: f64,
    mrope_section: Vec<usize>,
    kv_cache: Mutex<KvCache>,
}

impl Attention {
    fn load(cfg: &Qwen2VlConfig, head_dim: usize, vb: VarBuilder) -> Result<Self> {
        if cfg.num_key_value_heads == 0
            || !cfg.num_attention_heads.is_multiple_of(cfg.num_key_value_heads)
        {
            candle_core::bail!(
                "num_attention_heads ({}) must be divisible by num_key_value_heads ({})",
                cfg.num_attention_heads,
                cfg.num_key_value_heads
            );
        }
        let q_proj = linear(
            cfg.hidden_size,
            cfg.num_attention_heads * head_dim,
            vb.pp("self_attn.q_proj"),
        )?;
        let k_proj = linear(
            cfg.hidden_size,
            cfg.num_key_value_heads * head_dim,
            vb.pp("self_attn.k_proj"),
        )?;
        let v_proj = linear(
            cfg.hidden_size,
            cfg.num_key_value_heads * head_dim,
            vb.pp("self_attn.v_proj"),
        )?;
        let o_proj = linear_no_bias(
            cfg.num_attention_heads * head_dim,
            cfg.hidden_size,
            vb.pp("self_attn.o_proj"),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            num_kv_groups: cfg.num_attention_heads / cfg.num_key_value_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
            mrope_section: cfg.rope_scaling.mrope_section.clone(),
            kv_cache: Mutex::new(KvCache::new(2, cfg.max_position_embeddings.max(8192))),
        })
    }

    fn forward(
        &self,
        hidden: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        is_prefill: bool,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = hidden.dims3()?;

        let project = |proj: &Linear, heads: usize| -> Result<Tensor> {
            proj.forward(hidden)?
                .reshape((b, seq_len, heads, self.head_dim))?
                .transpose(1, 2)
        };
        let q = project(&self.q_proj, self.num_heads)?;
        let k = project(&self.k_proj, self.num_kv_heads)?;
        let v = project(&self.v_proj, self.num_kv_heads)?;

        let (q, k) = apply_multimodal_rope(&q, &k, cos, sin, &self.mrope_section)?;
        let k = k.contiguous()?;
        let v = v.contiguous()?;

        let (k, v) = {
            let mut cache = self
                .kv_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache.append(&k, &v)?
        };
        let k = repeat_kv(&k, self.num_kv_groups)?;
        let v = repeat_kv(&v, self.num_kv_groups)?;

        let attn = scaled_dot_product_attention(&q, &k, &v, self.scaling, is_prefill)?;
        let attn = attn
            .transpose(1, 2)?
            .reshape((b, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&attn)
    }

    fn reset_cache(&self) {
        self.kv_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .reset();
    }
}

#[derive(Debug)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: candle_nn::RmsNorm,
    post_attention_layernorm: candle_nn::RmsNorm,
}

impl DecoderLayer {
    fn load(cfg: &Qwen2VlConfig, head_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(cfg, head_dim, vb.clone())?,
            mlp: Mlp::load(cfg, vb.clone())?,
            input_layernorm: rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, hidden: &Tensor, cos: &Tensor, sin: &Tensor, is_prefill: bool) -> Result<Tensor> {
        let residual = hidden;
        let hidden = self.input_layernorm.forward(hidden)?;
        let hidden = (residual + self.self_attn.forward(&hidden, cos, sin, is_prefill)?)?;

        let residual = &hidden;
        let out = self.post_attention_layernorm.forward(&hidden)?;
        residual + self.mlp.forward(&out)?
    }
}

/// The decoder stack shared by prefill and incremental decode.
pub struct TextModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: candle_nn::RmsNorm,
    rope: MultiAxisRope,
}

impl TextModel {
    pub fn load(cfg: &Qwen2VlConfig, head_dim: usize, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(DecoderLayer::load(cfg, head_dim, vb.pp(format!("layers.{i}")))?);
        }
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        let rope = MultiAxisRope::new(head_dim, cfg.rope_theta, 3, vb.device())?;
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rope,
        })
    }

    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)
    }

    /// Embedding matrix, for weight-tied language-model heads.
    pub fn token_embedding_weight(&self) -> Tensor {
        self.embed_tokens.embeddings().clone()
    }

    /// Runs the stack over `inputs_embeds` with position ids of shape
    /// `(3, batch, seq)`. `is_prefill` selects causal masking; decode steps
    /// with one query position need none.
    pub fn forward(
        &self,
        inputs_embeds: &Tensor,
        position_ids: &Tensor,
        is_prefill: bool,
    ) -> Result<Tensor> {
        let (cos, sin) = self.rope.cos_sin(position_ids, inputs_embeds.dtype())?;
        let mut hidden = inputs_embeds.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &cos, &sin, is_prefill)?;
        }
        self.norm.forward(&hidden)
    }

    /// Drops all cached KV state, starting a fresh generation session.
    pub fn reset_session(&self) {
        for layer in &self.layers {
            layer.self_attn.reset_cache();
        }
    }
}
