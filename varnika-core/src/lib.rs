#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod device_map;
pub mod loader;
mod loader_factory;
mod util;

mod stable_diffusion;

pub use device_map::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
use serde::{Deserialize, Serialize};
pub use stable_diffusion::{StableDiffusionLoader, StableDiffusionModel, StableDiffusionVersion};
pub use util::{image_to_base64_png, select_best_device, select_dtype, tensor_to_image};

// Body of `POST /generate`; only `prompt` is required.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub steps: Option<usize>,
    #[serde(default)]
    pub guidance_scale: Option<f64>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: None,
            height: None,
            steps: None,
            guidance_scale: None,
            seed: None,
        }
    }
}

/// A loaded text-to-image pipeline shared by every request.
pub trait ModelLike: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_only_request_leaves_tuning_unset() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "a lighthouse at dusk"}"#).unwrap();
        assert_eq!(req, GenerationRequest::new("a lighthouse at dusk"));
    }

    #[test]
    fn frontend_fields_are_accepted() {
        let req: GenerationRequest = serde_json::from_str(
            r#"{"prompt": "cat", "width": 512, "height": 768, "steps": 20, "seed": 7}"#,
        )
        .unwrap();
        assert_eq!(req.width, Some(512));
        assert_eq!(req.height, Some(768));
        assert_eq!(req.steps, Some(20));
        assert_eq!(req.seed, Some(7));
        assert_eq!(req.guidance_scale, None);
    }

    #[test]
    fn prompt_is_required_and_must_be_a_string() {
        assert!(serde_json::from_str::<GenerationRequest>(r#"{}"#).is_err());
        assert!(serde_json::from_str::<GenerationRequest>(r#"{"prompt": 42}"#).is_err());
    }
}
