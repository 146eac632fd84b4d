//! Vision tower: patch embedding, rotary-encoded full-attention transformer
//! blocks, and the spatial patch merger that projects into the language
//! model's embedding space.
//!
//! Internal functions return `candle_core::Result`; the model facade converts
//! failures into the crate error taxonomy at its boundary.

use crate::vl::attention::{rotate_half, scaled_dot_product_attention};
use crate::vl::config::VisionConfig;
use candle_core::{D, DType, Device, IndexOp, Result, Tensor};
use candle_nn::{
    LayerNorm, LayerNormConfig, Linear, Module, VarBuilder, layer_norm, linear,
};

fn quick_gelu(xs: &Tensor) -> Result<Tensor> {
    let scaled = (xs * 1.702)?;
    xs * candle_nn::ops::sigmoid(&scaled)?
}

#[derive(Debug, Clone, Copy)]
enum VisionAct {
    QuickGelu,
    Gelu,
    Silu,
}

impl VisionAct {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "quick_gelu" => Ok(Self::QuickGelu),
            "gelu" | "gelu_new" | "gelu_pytorch_tanh" => Ok(Self::Gelu),
            "silu" => Ok(Self::Silu),
            _ => candle_core::bail!("unsupported vision hidden_act '{name}'"),
        }
    }

    fn forward(self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::QuickGelu => quick_gelu(xs),
            Self::Gelu => xs.gelu_erf(),
            Self::Silu => candle_nn::ops::silu(xs),
        }
    }
}

/// Projects flat patch vectors into the embedding width.
///
/// Checkpoints store the projection either flattened or as a conv weight
/// `(embed, C, T, P, P)`; both are accepted.
#[derive(Debug, Clone)]
struct PatchEmbed {
    weight: Tensor,
}

impl PatchEmbed {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let patch_dim = cfg.in_channels * cfg.temporal_patch_size * cfg.patch_size * cfg.patch_size;
        let weight = match vb.get((cfg.embed_dim, patch_dim), "patch_embed.proj.weight") {
            Ok(weight) => weight,
            Err(_) => vb
                .get(
                    (
                        cfg.embed_dim,
                        cfg.in_channels,
                        cfg.temporal_patch_size,
                        cfg.patch_size,
                        cfg.patch_size,
                    ),
                    "patch_embed.proj.weight",
                )?
                .reshape((cfg.embed_dim, patch_dim))?,
        };
        Ok(Self { weight })
    }

    fn forward(&self, patches: &Tensor) -> Result<Tensor> {
        patches
            .to_dtype(self.weight.dtype())?
            .matmul(&self.weight.transpose(0, 1)?)
    }
}

/// Rotary embedding over the patch grid's height/width axes.
#[derive(Debug, Clone)]
struct VisionRope {
    inv_freq: Tensor,
}

impl VisionRope {
    fn new(dim: usize, theta: f64, device: &Device) -> Result<Self> {
        let mut inv_freq = Vec::with_capacity(dim / 2);
        for i in (0..dim).step_by(2) {
            inv_freq.push((1f64 / theta.powf(i as f64 / dim as f64)) as f32);
        }
        let inv_freq = Tensor::from_vec(inv_freq, (dim / 2,), device)?;
        Ok(Self { inv_freq })
    }

    /// `(cos, sin)` for the patch grid, ordered to match the merge-block
    /// patch traversal used during preprocessing.
    fn cos_sin(
        &self,
        grid: (usize, usize, usize),
        merge_size: usize,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let (t, h, w) = grid;
        let freq_dim = self.inv_freq.dims1()?;
        let inv: Vec<f32> = self.inv_freq.to_vec1()?;

        let mut rows = Vec::with_capacity(t * h * w * freq_dim * 2);
        for _ in 0..t {
            for hb in 0..(h / merge_size) {
                for wb in 0..(w / merge_size) {
                    for h_inner in 0..merge_size {
                        for w_inner in 0..merge_size {
                            let hp = (hb * merge_size + h_inner) as f32;
                            let wp = (wb * merge_size + w_inner) as f32;
                            for &f in &inv {
                                rows.push(hp * f);
                            }
                            for &f in &inv {
                                rows.push(wp * f);
                            }
                        }
                    }
                }
            }
        }

        let num_patches = t * h * w;
        let rotary = Tensor::from_vec(rows, (num_patches, freq_dim * 2), device)?;
        let emb = Tensor::cat(&[&rotary, &rotary], D::Minus1)?;
        Ok((emb.cos()?, emb.sin()?))
    }
}

fn apply_vision_rope(q: &Tensor, k: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<(Tensor, Tensor)> {
    let orig_dtype = q.dtype();
    let q = q.to_dtype(DType::F32)?;
    let k = k.to_dtype(DType::F32)?;
    let cos = cos.unsqueeze(1)?.to_dtype(DType::F32)?;
    let sin = sin.unsqueeze(1)?.to_dtype(DType::F32)?;

    let rotate_3d = |x: &Tensor| -> Result<Tensor> {
        let d = x.dim(D::Minus1)?;
        let x1 = x.i((.., .., 0..d / 2))?;
        let x2 = x.i((.., .., d / 2..d))?;
        Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
    };

    let q_embed = (q.broadcast_mul(&cos)? + rotate_3d(&q)?.broadcast_mul(&sin)?)?;
    let k_embed = (k.broadcast_mul(&cos)? + rotate_3d(&k)?.broadcast_mul(&sin)?)?;
    Ok((q_embed.to_dtype(orig_dtype)?, k_embed.to_dtype(orig_dtype)?))
}

#[derive(Debug, Clone)]
struct VisionAttention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl VisionAttention {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.num_heads == 0 || !cfg.embed_dim.is_multiple_of(cfg.num_heads) {
            candle_core::bail!(
                "vision embed_dim {} not divisible by num_heads {}",
                cfg.embed_dim,
                cfg.num_heads
            );
        }
        let qkv = linear(cfg.embed_dim, cfg.embed_dim * 3, vb.pp("attn.qkv"))?;
        let proj = linear(cfg.embed_dim, cfg.embed_dim, vb.pp("attn.proj"))?;
        let head_dim = cfg.embed_dim / cfg.num_heads;
        Ok(Self {
            qkv,
            proj,
            num_heads: cfg.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn forward(&self, hidden: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let seq_len = hidden.dim(0)?;
        let qkv = self
            .qkv
            .forward(hidden)?
            .reshape((seq_len, 3, self.num_heads, self.head_dim))?;
        let q = qkv.i((.., 0, .., ..))?;
        let k = qkv.i((.., 1, .., ..))?;
        let v = qkv.i((.., 2, .., ..))?;

        let (q, k) = apply_vision_rope(&q, &k, cos, sin)?;

        let to_bhsd = |x: &Tensor| -> Result<Tensor> {
            x.transpose(0, 1)?.unsqueeze(0)?.contiguous()
        };
        let q = to_bhsd(&q)?;
        let k = to_bhsd(&k)?;
        let v = to_bhsd(&v)?.to_dtype(q.dtype())?;

        let attn = scaled_dot_product_attention(&q, &k, &v, self.scale, false)?;
        let attn = attn
            .transpose(1, 2)?
            .reshape((seq_len, self.num_heads * self.head_dim))?;
        self.proj.forward(&attn)
    }
}

#[derive(Debug, Clone)]
struct VisionMlp {
    fc1: Linear,
    fc2: Linear,
    act: VisionAct,
}

impl VisionMlp {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_dim = cfg.mlp_hidden_dim();
        Ok(Self {
            fc1: linear(cfg.embed_dim, hidden_dim, vb.pp("mlp.fc1"))?,
            fc2: linear(hidden_dim, cfg.embed_dim, vb.pp("mlp.fc2"))?,
            act: VisionAct::from_name(cfg.hidden_act.as_str())?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.act.forward(&self.fc1.forward(xs)?)?)
    }
}

#[derive(Debug, Clone)]
struct VisionBlock {
    norm1: LayerNorm,
    norm2: LayerNorm,
    attn: VisionAttention,
    mlp: VisionMlp,
}

impl VisionBlock {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let norm_cfg = LayerNormConfig {
            eps: 1e-6,
            ..Default::default()
        };
        Ok(Self {
            norm1: layer_norm(cfg.embed_dim, norm_cfg, vb.pp("norm1"))?,
            norm2: layer_norm(cfg.embed_dim, norm_cfg, vb.pp("norm2"))?,
            attn: VisionAttention::load(cfg, vb.clone())?,
            mlp: VisionMlp::load(cfg, vb)?,
        })
    }

    fn forward(&self, hidden: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let hidden = (hidden + self.attn.forward(&self.norm1.forward(hidden)?, cos, sin)?)?;
        &hidden + self.mlp.forward(&self.norm2.forward(&hidden)?)?
    }
}

/// Merges `merge_size x merge_size` neighborhoods and projects into the
/// language-model width.
#[derive(Debug, Clone)]
struct PatchMerger {
    ln_q: LayerNorm,
    mlp1: Linear,
    mlp2: Linear,
    merge_size: usize,
    merged_dim: usize,
}

impl PatchMerger {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let norm_cfg = LayerNormConfig {
            eps: 1e-6,
            ..Default::default()
        };
        let merged_dim = cfg.embed_dim * cfg.spatial_merge_size * cfg.spatial_merge_size;
        Ok(Self {
            ln_q: layer_norm(cfg.embed_dim, norm_cfg, vb.pp("merger.ln_q"))?,
            mlp1: linear(merged_dim, merged_dim, vb.pp("merger.mlp.0"))?,
            mlp2: linear(merged_dim, cfg.hidden_size, vb.pp("merger.mlp.2"))?,
            merge_size: cfg.spatial_merge_size,
            merged_dim,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let num_patches = x.dim(0)?;
        let group = self.merge_size * self.merge_size;
        if !num_patches.is_multiple_of(group) {
            candle_core::bail!("merger expects num_patches divisible by {group}, got {num_patches}");
        }
        let x = self.ln_q.forward(x)?;
        let x = x.reshape((num_patches / group, self.merged_dim))?;
        let x = self.mlp1.forward(&x)?.gelu_erf()?;
        self.mlp2.forward(&x)
    }
}

/// The full vision tower.
pub struct VisionModel {
    patch_embed: PatchEmbed,
    blocks: Vec<VisionBlock>,
    merger: PatchMerger,
    rope: VisionRope,
    merge_size: usize,
}

impl VisionModel {
    pub fn load(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = cfg.embed_dim / cfg.num_heads.max(1);
        if !head_dim.is_multiple_of(2) {
            candle_core::bail!("vision head_dim {head_dim} must be even for rotary embeddings");
        }
        let patch_embed = PatchEmbed::load(cfg, vb.clone())?;
        let mut blocks = Vec::with_capacity(cfg.depth);
        for i in 0..cfg.depth {
            blocks.push(VisionBlock::load(cfg, vb.pp(format!("blocks.{i}")))?);
        }
        let merger = PatchMerger::load(cfg, vb.clone())?;
        let rope = VisionRope::new(head_dim / 2, 10_000.0, vb.device())?;
        Ok(Self {
            patch_embed,
            blocks,
            merger,
            rope,
            merge_size: cfg.spatial_merge_size,
        })
    }

    /// Encodes one image's patches into language-model embeddings of shape
    /// `(num_patches / merge^2, hidden_size)`.
    pub fn forward(&self, pixel_values: &Tensor, grid: (usize, usize, usize)) -> Result<Tensor> {
        let (cos, sin) = self
            .rope
            .cos_sin(grid, self.merge_size, pixel_values.device())?;
        let cos = cos.to_dtype(pixel_values.dtype())?;
        let sin = sin.to_dtype(pixel_values.dtype())?;

        let mut hidden = self.patch_embed.forward(pixel_values)?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, &cos, &sin)?;
        }
        self.merger.forward(&hidden)
    }
}
