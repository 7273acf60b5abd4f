//! Domain services: remote collaborators, media resolution, the
//! transcription pipeline and the settlement importer.

pub mod asr;
pub mod cos;
pub mod media;
pub mod settlement_import;
pub mod transcription;
