use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, ModelLike, ModelVariant};

/// Knobs that only matter while building the networks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub use_flash_attn: bool,
    pub sliced_attention_size: Option<usize>,
}

pub trait Loader {
    type Model: ModelLike;

    fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
        options: LoadOptions,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
