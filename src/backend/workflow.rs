//! Deterministic composition of a ComfyUI-shaped node graph from a validated
//! [`GenerationRequest`] (§4.3). Given the same request (and an already
//! resolved seed) this always produces the same graph.

use crate::model::{GenerationRequest, Sampler};
use serde_json::{json, Value};

fn sampler_name(sampler: Sampler) -> &'static str {
    match sampler {
        Sampler::Euler => "euler",
        Sampler::EulerAncestral => "euler_ancestral",
        Sampler::Heun => "heun",
        Sampler::Dpm2 => "dpm_2",
        Sampler::Dpm2Ancestral => "dpm_2_ancestral",
        Sampler::Lms => "lms",
        Sampler::DpmFast => "dpm_fast",
        Sampler::DpmAdaptive => "dpm_adaptive",
        Sampler::Dpmpp2sAncestral => "dpmpp_2s_ancestral",
        Sampler::Dpmpp2m => "dpmpp_2m",
        Sampler::DpmppSde => "dpmpp_sde",
        Sampler::Ddim => "ddim",
        Sampler::Plms => "plms",
        Sampler::UniPc => "uni_pc",
    }
}

/// Resolves `seed == -1` to a freshly chosen random non-negative i32, and
/// returns the graph plus the seed actually used (callers persist it back
/// onto the request so retries of the same job id are reproducible).
pub fn resolve_seed(request: &GenerationRequest) -> i64 {
    if request.seed == -1 {
        use rand::Rng;
        rand::rng().random_range(0..=i64::from(i32::MAX))
    } else {
        request.seed
    }
}

/// Builds the node graph. `client_id` tags the submission so progress
/// messages on the backend's own websocket (if consumed) can be correlated.
pub fn compose(request: &GenerationRequest, seed: i64, client_id: &str) -> Value {
    let negative_prompt = request.negative_prompt.clone().unwrap_or_default();

    json!({
        "client_id": client_id,
        "prompt": {
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": seed,
                    "steps": request.steps,
                    "cfg": request.cfg_scale,
                    "sampler_name": sampler_name(request.sampler),
                    "scheduler": "normal",
                    "denoise": 1.0,
                    "model": ["4", 0],
                    "positive": ["6", 0],
                    "negative": ["7", 0],
                    "latent_image": ["5", 0]
                }
            },
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": request.model }
            },
            "5": {
                "class_type": "EmptyLatentImage",
                "inputs": {
                    "width": request.width,
                    "height": request.height,
                    "batch_size": request.num_images
                }
            },
            "6": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": request.prompt, "clip": ["4", 1] }
            },
            "7": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": negative_prompt, "clip": ["4", 1] }
            },
            "8": {
                "class_type": "VAEDecode",
                "inputs": { "samples": ["3", 0], "vae": ["4", 2] }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": { "filename_prefix": "comfy_queue", "images": ["8", 0] }
            }
        }
    })
}
