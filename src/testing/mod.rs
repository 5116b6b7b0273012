//! In-memory fakes for the component traits, so the property tests of
//! spec.md §8 run without a live Redis/S3/ComfyUI (SPEC_FULL A.4).

pub mod fakes;
