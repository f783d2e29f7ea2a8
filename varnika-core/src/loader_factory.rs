use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, LoadOptions, Loader, ModelLike, StableDiffusionLoader};
use std::sync::Arc;

use crate::stable_diffusion::StableDiffusionVersion;

/// Enum of supported model types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    StableDiffusion,
}

impl ModelType {
    /// Detect model type from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("STABLE-DIFFUSION") || name_upper.contains("STABLE_DIFFUSION") {
            Some(ModelType::StableDiffusion)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelVariant {
    /// Weights are fetched from `repo`, a diffusers-layout Hugging Face repository.
    StableDiffusion {
        version: StableDiffusionVersion,
        repo: String,
    },
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        match ModelType::from_name(model_name)? {
            ModelType::StableDiffusion => {
                let name_upper = model_name.to_uppercase();
                let version = if ["2-1", "2.1", "2_1"].iter().any(|v| name_upper.contains(v)) {
                    StableDiffusionVersion::V2_1
                } else {
                    StableDiffusionVersion::V1_5
                };
                Some(ModelVariant::StableDiffusion {
                    version,
                    repo: model_name.to_string(),
                })
            }
        }
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
    options: LoadOptions,
) -> Result<Arc<dyn ModelLike>> {
    let model_type = ModelType::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model type: {}", model_name))?;
    let model_variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    tracing::info!(
        model = model_name,
        "Loading model (detected type: {:?}/variant: {:?})",
        model_type,
        model_variant
    );

    match model_type {
        ModelType::StableDiffusion => {
            let model = StableDiffusionLoader::load(model_variant, api, device_map, options).await?;
            Ok(Arc::new(model))
        }
    }
}
