use std::time::Instant;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::{
    select_best_device, select_dtype, tensor_to_image, DeviceMap, GenerationRequest, LoadOptions,
    Loader, ModelLike, ModelVariant,
};

const DEFAULT_STEPS: usize = 50;
const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
const MAX_SIZE: usize = 2048;
// Training timesteps of the v1.5 / v2.1 schedulers.
const TRAIN_TIMESTEPS: usize = 1000;
const VAE_SCALE: f64 = 0.18215;
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StableDiffusionVersion {
    #[serde(rename = "v1-5")]
    V1_5,
    #[serde(rename = "v2-1")]
    V2_1,
}

serde_plain::derive_display_from_serialize!(StableDiffusionVersion);
serde_plain::derive_fromstr_from_deserialize!(StableDiffusionVersion);

impl StableDiffusionVersion {
    fn config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
        }
    }

    /// Output size used when the request does not pick one.
    pub fn native_size(&self) -> usize {
        match self {
            Self::V1_5 => 512,
            Self::V2_1 => 768,
        }
    }

    fn unet_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "unet/diffusion_pytorch_model.fp16.safetensors"
        } else {
            "unet/diffusion_pytorch_model.safetensors"
        }
    }

    fn vae_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "vae/diffusion_pytorch_model.fp16.safetensors"
        } else {
            "vae/diffusion_pytorch_model.safetensors"
        }
    }

    fn clip_file(&self) -> &'static str {
        "text_encoder/model.safetensors"
    }
}

/// Per-request sampling settings after defaults are applied.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sampling {
    width: usize,
    height: usize,
    steps: usize,
    guidance_scale: f64,
}

impl Sampling {
    fn resolve(request: &GenerationRequest, version: StableDiffusionVersion) -> Result<Self> {
        let width = request.width.unwrap_or(version.native_size());
        let height = request.height.unwrap_or(version.native_size());
        let steps = request.steps.unwrap_or(DEFAULT_STEPS);
        let guidance_scale = request.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE);

        if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
            anyhow::bail!("width and height must be non-zero multiples of 8, got {width}x{height}");
        }
        if width > MAX_SIZE || height > MAX_SIZE {
            anyhow::bail!("width and height must be at most {MAX_SIZE}, got {width}x{height}");
        }
        if steps == 0 || steps > TRAIN_TIMESTEPS {
            anyhow::bail!("steps must be between 1 and {TRAIN_TIMESTEPS}, got {steps}");
        }

        Ok(Self {
            width,
            height,
            steps,
            guidance_scale,
        })
    }

    fn use_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }
}

/// Standard normal latents. A seed makes them reproducible on every device,
/// including the CPU whose rng cannot be reseeded.
fn initial_noise(
    seed: Option<u64>,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    match seed {
        Some(seed) => {
            let mut rng = StdRng::seed_from_u64(seed);
            let (b, c, h, w) = shape;
            let noise: Vec<f32> = (0..b * c * h * w)
                .map(|_| rng.sample::<f32, _>(StandardNormal))
                .collect();
            Ok(Tensor::from_vec(noise, shape, &Device::Cpu)?.to_device(device)?)
        }
        None => Ok(Tensor::randn(0f32, 1f32, shape, device)?),
    }
}

pub struct StableDiffusionModel {
    name: String,
    version: StableDiffusionVersion,
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    clip_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusionModel {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.max_tokens;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            anyhow::bail!(
                "the prompt is too long, {} > max-tokens ({max_len})",
                tokens.len()
            );
        }
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&tokens)?)
    }
}

impl ModelLike for StableDiffusionModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, request: GenerationRequest) -> Result<DynamicImage> {
        let sampling = Sampling::resolve(&request, self.version)?;
        let Sampling {
            width,
            height,
            steps,
            guidance_scale,
        } = sampling;
        let use_guidance = sampling.use_guidance();

        let start = Instant::now();

        // --- Text embeddings, unconditional first when guiding ---
        let text_embeddings = self.encode_prompt(&request.prompt)?;
        let text_embeddings = if use_guidance {
            let uncond_prompt = request.negative_prompt.as_deref().unwrap_or("");
            let uncond_embeddings = self.encode_prompt(uncond_prompt)?;
            Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?
        } else {
            text_embeddings
        };
        let text_embeddings = text_embeddings.to_dtype(self.dtype)?;

        // --- Initial latents ---
        let mut scheduler = self.version.config(None).build_scheduler(steps)?;
        let latents = initial_noise(request.seed, (1, 4, height / 8, width / 8), &self.device)?;
        let latents = (latents * scheduler.init_noise_sigma())?;
        let mut latents = latents.to_dtype(self.dtype)?;

        // --- Denoising loop ---
        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
                (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            tracing::debug!(step = index + 1, total = timesteps.len(), "denoising step");
        }
        tracing::info!(
            steps,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Generated latent image"
        );

        // --- Decode and map [-1, 1] to [0, 255] ---
        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let img = ((decoded.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
        tracing::info!(width, height, "Decoded image");

        tensor_to_image(&img.i(0)?)
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
        options: LoadOptions,
    ) -> Result<Self::Model> {
        let ModelVariant::StableDiffusion { version, repo } = variant;

        if options.use_flash_attn && !cfg!(feature = "flash-attn") {
            anyhow::bail!("flash attention requested but the `flash-attn` feature is disabled");
        }

        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = select_dtype(&device);
        let use_f16 = dtype == DType::F16;
        tracing::info!(%version, ?device, ?dtype, "Configured device");

        let config = version.config(options.sliced_attention_size);
        let sd_repo = api.model(repo.clone());

        // --- Load Tokenizer ---
        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no pad token {pad_token:?}"))?;

        // --- Load CLIP text encoder (kept in f32) ---
        let clip_file = sd_repo
            .get(version.clip_file())
            .await
            .context("failed to get CLIP model file")?;
        let clip_model =
            stable_diffusion::build_clip_transformer(&config.clip, clip_file, &device, DType::F32)
                .context("failed to load CLIP model")?;
        tracing::info!("Loaded CLIP text encoder");

        // --- Load UNet ---
        let unet_file = sd_repo
            .get(version.unet_file(use_f16))
            .await
            .context("failed to get UNet model file")?;
        let unet = config
            .build_unet(unet_file, &device, 4, options.use_flash_attn, dtype)
            .context("failed to load UNet")?;
        tracing::info!("Loaded UNet");

        // --- Load Autoencoder ---
        let vae_file = sd_repo
            .get(version.vae_file(use_f16))
            .await
            .context("failed to get autoencoder model file")?;
        let vae = config
            .build_vae(vae_file, &device, dtype)
            .context("failed to load autoencoder")?;
        tracing::info!("Loaded autoencoder");

        Ok(StableDiffusionModel {
            name: repo,
            version,
            device,
            dtype,
            tokenizer,
            pad_id,
            max_tokens: config.clip.max_position_embeddings,
            clip_model,
            unet,
            vae,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &str) -> GenerationRequest {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn prompt_only_request_uses_native_defaults() {
        let v1 = Sampling::resolve(&request(r#"{"prompt": "x"}"#), StableDiffusionVersion::V1_5)
            .unwrap();
        assert_eq!(
            v1,
            Sampling {
                width: 512,
                height: 512,
                steps: 50,
                guidance_scale: 7.5,
            }
        );
        assert!(v1.use_guidance());

        let v2 = Sampling::resolve(&request(r#"{"prompt": "x"}"#), StableDiffusionVersion::V2_1)
            .unwrap();
        assert_eq!((v2.width, v2.height), (768, 768));
    }

    #[test]
    fn explicit_settings_are_kept() {
        let sampling = Sampling::resolve(
            &request(
                r#"{"prompt": "x", "width": 640, "height": 384, "steps": 20, "guidance_scale": 1.0}"#,
            ),
            StableDiffusionVersion::V1_5,
        )
        .unwrap();
        assert_eq!((sampling.width, sampling.height, sampling.steps), (640, 384, 20));
        assert!(!sampling.use_guidance());
    }

    #[test]
    fn sizes_must_be_non_zero_multiples_of_eight() {
        for body in [
            r#"{"prompt": "x", "width": 0}"#,
            r#"{"prompt": "x", "height": 0}"#,
            r#"{"prompt": "x", "width": 513}"#,
            r#"{"prompt": "x", "height": 100}"#,
        ] {
            assert!(Sampling::resolve(&request(body), StableDiffusionVersion::V1_5).is_err());
        }
    }

    #[test]
    fn oversized_images_are_rejected() {
        let max = Sampling::resolve(
            &request(r#"{"prompt": "x", "width": 2048, "height": 2048}"#),
            StableDiffusionVersion::V1_5,
        );
        assert!(max.is_ok());

        for body in [
            r#"{"prompt": "x", "width": 1000000, "height": 1000000}"#,
            r#"{"prompt": "x", "width": 2056}"#,
        ] {
            assert!(Sampling::resolve(&request(body), StableDiffusionVersion::V1_5).is_err());
        }
    }

    #[test]
    fn steps_are_bounded_by_training_timesteps() {
        let resolve = |steps: usize| {
            Sampling::resolve(
                &request(&format!(r#"{{"prompt": "x", "steps": {steps}}}"#)),
                StableDiffusionVersion::V1_5,
            )
        };
        assert!(resolve(0).is_err());
        assert!(resolve(1).is_ok());
        assert!(resolve(1000).is_ok());
        assert!(resolve(1001).is_err());
    }

    #[test]
    fn seeded_noise_works_on_cpu_and_is_reproducible() {
        let device = select_best_device(DeviceMap::ForceCpu).unwrap();
        let shape = (1, 4, 8, 8);

        let a = initial_noise(Some(7), shape, &device).unwrap();
        let b = initial_noise(Some(7), shape, &device).unwrap();
        let c = initial_noise(Some(8), shape, &device).unwrap();
        assert_eq!(a.dims4().unwrap(), shape);
        assert_eq!(a.dtype(), DType::F32);

        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mean = a.iter().sum::<f32>() / a.len() as f32;
        assert!(mean.abs() < 0.5, "mean of standard normal noise was {mean}");
    }

    #[test]
    fn unseeded_noise_has_the_requested_shape() {
        let noise = initial_noise(None, (1, 4, 2, 3), &Device::Cpu).unwrap();
        assert_eq!(noise.dims4().unwrap(), (1, 4, 2, 3));
    }

    #[test]
    fn version_names_round_trip_through_strings() {
        assert_eq!(StableDiffusionVersion::V1_5.to_string(), "v1-5");
        assert_eq!(
            "v2-1".parse::<StableDiffusionVersion>().unwrap(),
            StableDiffusionVersion::V2_1
        );
        assert!("v3".parse::<StableDiffusionVersion>().is_err());
    }

    #[test]
    fn half_precision_uses_fp16_weight_files() {
        let v = StableDiffusionVersion::V1_5;
        assert_eq!(v.unet_file(true), "unet/diffusion_pytorch_model.fp16.safetensors");
        assert_eq!(v.vae_file(false), "vae/diffusion_pytorch_model.safetensors");
        assert_eq!(v.clip_file(), "text_encoder/model.safetensors");
    }

    #[test]
    fn native_sizes_match_configs() {
        for version in [StableDiffusionVersion::V1_5, StableDiffusionVersion::V2_1] {
            let config = version.config(None);
            assert_eq!(config.width, version.native_size());
            assert_eq!(config.height, version.native_size());
        }
    }

    #[test]
    fn v2_pads_with_exclamation_mark() {
        assert_eq!(
            StableDiffusionVersion::V2_1.config(None).clip.pad_with.as_deref(),
            Some("!")
        );
        assert_eq!(StableDiffusionVersion::V1_5.config(None).clip.pad_with, None);
    }
}
