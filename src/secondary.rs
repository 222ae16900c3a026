//! Secondary diffusion model
//!
//! A compact convolutional U-Net that predicts the velocity `v` of a noisy
//! image at continuous time `t`. It is only ever used as a cheap surrogate
//! of the main network when computing guidance gradients; gradients are
//! taken by differentiating through [`SecondaryDenoiser::forward`].
//!
//! The network is an explicit list of typed stages built from the level
//! count in [`SecondaryConfig`]:
//!
//! ```text
//! stem ─┬─ down 1 ─┬─ down 2 ─ … ─┬─ bottleneck ─┐
//!       │          │              └──── up L-1 ◄─┘
//!       │          └──────────────────── up 1 ◄─┘
//!       └──────────────────────────────── head ◄─┘
//! ```
//!
//! Every down stage average-pools by 2 and every up stage ends with a 2x
//! bilinear upsample. The arrows concatenate the processed path with the
//! stage input (processed first), doubling the channel width of the conv
//! that follows.
//!
//! Parameter names follow the published checkpoint
//! (`net.2.main.3.main.1.0.weight`, …), so the original `.pth` file loads
//! through [`candle_nn::VarBuilder::from_pth`].

use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder, conv2d};
use std::f64::consts::PI;

use crate::config::SecondaryConfig;
use crate::schedule::DiffusionOutput;

/// 3x3 convolution (padding 1) followed by ReLU.
#[derive(Debug)]
struct ConvBlock {
    conv: Conv2d,
}

impl ConvBlock {
    /// `vb` points at the block's slot in its parent sequence; the conv is
    /// the block's first child.
    fn new(vb: VarBuilder, c_in: usize, c_out: usize) -> Result<Self> {
        let conv = conv2d(c_in, c_out, 3, conv_config(), vb.pp("0"))?;
        Ok(Self { conv })
    }

    fn in_channels(&self) -> usize {
        self.conv.weight().dim(1).unwrap_or(0)
    }

    fn out_channels(&self) -> usize {
        self.conv.weight().dim(0).unwrap_or(0)
    }
}

impl Module for ConvBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.conv.forward(x)?.relu()
    }
}

fn conv_config() -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        ..Default::default()
    }
}

fn run_blocks(blocks: &[ConvBlock], x: Tensor) -> Result<Tensor> {
    blocks.iter().try_fold(x, |h, block| block.forward(&h))
}

/// Random Fourier features of a scalar input, frozen after initialization.
#[derive(Debug)]
pub struct FourierFeatures {
    weight: Tensor,
}

impl FourierFeatures {
    pub fn new(vb: VarBuilder, in_features: usize, out_features: usize, std: f64) -> Result<Self> {
        if out_features % 2 != 0 {
            candle_core::bail!("FourierFeatures needs an even output width, got {out_features}");
        }
        let weight = vb.get_with_hints(
            (out_features / 2, in_features),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: std,
            },
        )?;
        Ok(Self {
            weight: weight.detach(),
        })
    }

    pub fn out_features(&self) -> usize {
        self.weight.dim(0).unwrap_or(0) * 2
    }
}

impl Module for FourierFeatures {
    /// `(B, in) -> (B, out)`: `cat(cos(2π·x·Wᵀ), sin(2π·x·Wᵀ))`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = self.weight.to_dtype(x.dtype())?;
        let f = x.matmul(&weight.t()?)?.affine(2.0 * PI, 0.0)?;
        Tensor::cat(&[f.cos()?, f.sin()?], D::Minus1)
    }
}

/// Pool by 2, then two conv blocks widening to the level's channel count.
#[derive(Debug)]
struct DownStage {
    blocks: Vec<ConvBlock>,
}

/// Innermost level: pool, three blocks at the deepest width, one block
/// narrowing back, upsample.
#[derive(Debug)]
struct Bottleneck {
    blocks: Vec<ConvBlock>,
}

/// Consumes the concatenation of the deeper level's output with this
/// level's passthrough, narrows to the parent level, upsamples.
#[derive(Debug)]
struct UpStage {
    blocks: Vec<ConvBlock>,
}

/// Compact U-Net noise predictor used for fast gradient guidance.
#[derive(Debug)]
pub struct SecondaryDenoiser {
    config: SecondaryConfig,
    timestep_embed: FourierFeatures,
    stem: Vec<ConvBlock>,
    down: Vec<DownStage>,
    bottleneck: Bottleneck,
    /// Ordered deepest first, the order they run in.
    up: Vec<UpStage>,
    head_block: ConvBlock,
    head_out: Conv2d,
}

impl SecondaryDenoiser {
    pub fn new(vb: VarBuilder, config: SecondaryConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let cs = config.channels();
        let levels = config.num_downsamples();

        let timestep_embed = FourierFeatures::new(
            vb.pp("timestep_embed"),
            1,
            config.embed_features,
            config.embed_std,
        )?;

        let net = vb.pp("net");
        let stem = vec![
            ConvBlock::new(net.pp("0"), config.in_channels + config.embed_features, cs[0])?,
            ConvBlock::new(net.pp("1"), cs[0], cs[0])?,
        ];

        // Level k (1-based) lives at net.2.main(.3.main)^(k-1).
        let mut level_vb = net.pp("2").pp("main");
        let mut down = Vec::with_capacity(levels - 1);
        let mut up = Vec::with_capacity(levels - 1);
        for k in 1..levels {
            down.push(DownStage {
                blocks: vec![
                    ConvBlock::new(level_vb.pp("1"), cs[k - 1], cs[k])?,
                    ConvBlock::new(level_vb.pp("2"), cs[k], cs[k])?,
                ],
            });
            up.push(UpStage {
                blocks: vec![
                    ConvBlock::new(level_vb.pp("4"), cs[k] * 2, cs[k])?,
                    ConvBlock::new(level_vb.pp("5"), cs[k], cs[k - 1])?,
                ],
            });
            level_vb = level_vb.pp("3").pp("main");
        }
        up.reverse();

        let deepest = cs[levels];
        let bottleneck = Bottleneck {
            blocks: vec![
                ConvBlock::new(level_vb.pp("1"), cs[levels - 1], deepest)?,
                ConvBlock::new(level_vb.pp("2"), deepest, deepest)?,
                ConvBlock::new(level_vb.pp("3"), deepest, deepest)?,
                ConvBlock::new(level_vb.pp("4"), deepest, cs[levels - 1])?,
            ],
        };

        let head_block = ConvBlock::new(net.pp("3"), cs[0] * 2, cs[0])?;
        let head_out = conv2d(cs[0], config.in_channels, 3, conv_config(), net.pp("4"))?;

        Ok(Self {
            config,
            timestep_embed,
            stem,
            down,
            bottleneck,
            up,
            head_block,
            head_out,
        })
    }

    pub fn config(&self) -> &SecondaryConfig {
        &self.config
    }

    /// `(in_channels, out_channels)` of every conv block, stem to head, in
    /// execution order.
    pub fn block_widths(&self) -> Vec<(usize, usize)> {
        let stages = self
            .stem
            .iter()
            .chain(self.down.iter().flat_map(|s| s.blocks.iter()))
            .chain(self.bottleneck.blocks.iter())
            .chain(self.up.iter().flat_map(|s| s.blocks.iter()))
            .chain(std::iter::once(&self.head_block));
        stages.map(|b| (b.in_channels(), b.out_channels())).collect()
    }

    /// Number of skip levels around the bottleneck.
    pub fn num_levels(&self) -> usize {
        self.down.len()
    }

    /// Predict `v` for `x: (B, C, H, W)` at continuous times `t: (B,)`.
    pub fn forward(&self, x: &Tensor, t: &Tensor) -> Result<DiffusionOutput> {
        let (b, c, h, w) = x.dims4()?;
        if c != self.config.in_channels {
            candle_core::bail!(
                "secondary model expects {} input channels, got {c}",
                self.config.in_channels
            );
        }
        let divisor = self.config.spatial_divisor();
        if h % divisor != 0 || w % divisor != 0 {
            candle_core::bail!(
                "secondary model needs spatial dims divisible by {divisor}, got {h}x{w}"
            );
        }
        if t.dims() != [b] {
            candle_core::bail!("expected timesteps of shape ({b},), got {:?}", t.dims());
        }

        let t = t.to_dtype(x.dtype())?;
        let embed = self.timestep_embed.forward(&t.unsqueeze(1)?)?;
        let embed = embed
            .unsqueeze(2)?
            .unsqueeze(3)?
            .broadcast_as((b, self.timestep_embed.out_features(), h, w))?;
        let input = Tensor::cat(&[x, &embed], 1)?;

        let v = self.net(input)?;
        DiffusionOutput::from_velocity(x, &t, v)
    }

    fn net(&self, input: Tensor) -> Result<Tensor> {
        let mut skips = Vec::with_capacity(self.down.len() + 1);
        let mut h = run_blocks(&self.stem, input)?;
        for stage in &self.down {
            skips.push(h.clone());
            h = run_blocks(&stage.blocks, h.avg_pool2d(2)?)?;
        }
        skips.push(h.clone());

        h = run_blocks(&self.bottleneck.blocks, h.avg_pool2d(2)?)?;
        h = upsample_bilinear_2x(&h)?;

        for stage in &self.up {
            let skip = skips.pop().ok_or_else(missing_skip)?;
            h = run_blocks(&stage.blocks, Tensor::cat(&[&h, &skip], 1)?)?;
            h = upsample_bilinear_2x(&h)?;
        }

        let skip = skips.pop().ok_or_else(missing_skip)?;
        let h = self.head_block.forward(&Tensor::cat(&[&h, &skip], 1)?)?;
        self.head_out.forward(&h)
    }
}

fn missing_skip() -> candle_core::Error {
    candle_core::Error::Msg("secondary model skip stack exhausted".to_string())
}

/// 2x bilinear upsampling of `(B, C, H, W)` with `align_corners = false`.
///
/// Composed of slicing, affine and concatenation ops only, so it is
/// differentiable on every backend.
pub fn upsample_bilinear_2x(x: &Tensor) -> Result<Tensor> {
    let x = upsample_axis_2x(x, 2)?;
    upsample_axis_2x(&x, 3)
}

fn upsample_axis_2x(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let (prev, next) = if n == 1 {
        (x.clone(), x.clone())
    } else {
        let first = x.narrow(dim, 0, 1)?;
        let last = x.narrow(dim, n - 1, 1)?;
        (
            Tensor::cat(&[&first, &x.narrow(dim, 0, n - 1)?], dim)?,
            Tensor::cat(&[&x.narrow(dim, 1, n - 1)?, &last], dim)?,
        )
    };
    // Output 2i samples source i - 1/4, output 2i + 1 samples i + 1/4.
    let even = ((x * 0.75)? + (prev * 0.25)?)?;
    let odd = ((x * 0.75)? + (next * 0.25)?)?;
    let mut dims = x.dims().to_vec();
    dims[dim] *= 2;
    Tensor::stack(&[even, odd], dim + 1)?.reshape(dims)
}

/// Build a randomly initialized secondary model on `device`, useful when no
/// checkpoint is available (tests, smoke runs).
pub fn random_secondary(
    config: SecondaryConfig,
    device: &candle_core::Device,
) -> Result<(SecondaryDenoiser, candle_nn::VarMap)> {
    let varmap = candle_nn::VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = SecondaryDenoiser::new(vb, config)?;
    Ok((model, varmap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_upsample_matches_align_corners_false() -> Result<()> {
        let x = Tensor::new(&[[[[1f32, 3.0], [5.0, 7.0]]]], &Device::Cpu)?;
        let y = upsample_bilinear_2x(&x)?;
        assert_eq!(y.dims(), &[1, 1, 4, 4]);
        let rows = y.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        // Matches torch.nn.Upsample(scale_factor=2, mode="bilinear").
        let expected = [
            [1.0, 1.5, 2.5, 3.0],
            [2.0, 2.5, 3.5, 4.0],
            [4.0, 4.5, 5.5, 6.0],
            [5.0, 5.5, 6.5, 7.0],
        ];
        for (row, exp) in rows.iter().zip(expected.iter()) {
            for (a, b) in row.iter().zip(exp.iter()) {
                assert!((a - b).abs() < 1e-6, "{rows:?}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_upsample_single_pixel() -> Result<()> {
        let x = Tensor::new(&[[[[2f32]]]], &Device::Cpu)?;
        let y = upsample_bilinear_2x(&x)?;
        assert_eq!(y.flatten_all()?.to_vec1::<f32>()?, vec![2.0; 4]);
        Ok(())
    }

    #[test]
    fn test_fourier_features_shape() -> Result<()> {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ff = FourierFeatures::new(vb, 1, 16, 1.0)?;
        let t = Tensor::new(&[[0.0f32], [0.5]], &Device::Cpu)?;
        let out = ff.forward(&t)?;
        assert_eq!(out.dims(), &[2, 16]);
        // At t = 0 every cos term is 1 and every sin term 0.
        let row0 = out.get(0)?.to_vec1::<f32>()?;
        assert!(row0[..8].iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert!(row0[8..].iter().all(|v| v.abs() < 1e-6));
        Ok(())
    }
}
