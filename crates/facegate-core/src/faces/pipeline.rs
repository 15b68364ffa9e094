use facegate_config::{Dimensions, ResolvedConfig};
use tracing::debug;

use crate::capture::ImageSource;
use crate::errors::AppResult;
use crate::faces::detector::{build_detector, FaceLocalizer, FaceRegion};
use crate::faces::extractor::{Embedding, ExtractionFailure, FeatureExtractor};
use crate::faces::raster::normalize;
use crate::liveness::{LivenessCheck, LivenessVerdict, PassThroughLiveness};

/// What one image yielded after localization and extraction.
#[derive(Debug, Clone)]
pub enum FaceAnalysis {
    Face {
        region: FaceRegion,
        embedding: Embedding,
    },
    NoFace,
    ExtractionFailed(ExtractionFailure),
    Spoof(String),
}

/// Normalize, localize, check liveness, extract.
pub struct FacePipeline {
    localizer: FaceLocalizer,
    extractor: FeatureExtractor,
    liveness: Box<dyn LivenessCheck>,
    image_size: Dimensions,
    min_face_size: Dimensions,
}

impl FacePipeline {
    pub fn new(
        localizer: FaceLocalizer,
        extractor: FeatureExtractor,
        image_size: Dimensions,
        min_face_size: Dimensions,
    ) -> Self {
        Self {
            localizer,
            extractor,
            liveness: Box::new(PassThroughLiveness),
            image_size,
            min_face_size,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        let localizer = FaceLocalizer::new(
            build_detector(config.detector),
            config.detection_threshold,
            config.face_padding,
        );
        let extractor = FeatureExtractor::new(config.extraction_method, config.face_size);
        Self::new(
            localizer,
            extractor,
            config.image_size,
            config.min_face_size,
        )
    }

    pub fn with_liveness(mut self, liveness: Box<dyn LivenessCheck>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Decoding problems surface as input errors; every other negative
    /// outcome is folded into [`FaceAnalysis`].
    pub fn analyze(&self, source: &ImageSource) -> AppResult<FaceAnalysis> {
        let raster = normalize(source, self.image_size)?;
        let Some(region) = self.localizer.localize(&raster, self.min_face_size)? else {
            debug!(origin = %source.origin(), "no face found");
            return Ok(FaceAnalysis::NoFace);
        };

        if let LivenessVerdict::Spoof(reason) = self.liveness.assess(&region) {
            return Ok(FaceAnalysis::Spoof(reason));
        }

        match self.extractor.extract(region.image.as_rgb()) {
            Ok(embedding) => {
                debug!(
                    method = %self.extractor.method(),
                    len = embedding.len(),
                    confidence = region.confidence,
                    "embedding extracted"
                );
                Ok(FaceAnalysis::Face { region, embedding })
            }
            Err(failure) => Ok(FaceAnalysis::ExtractionFailed(failure)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::detector::tests::synthetic_face;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    struct RejectAll;

    impl LivenessCheck for RejectAll {
        fn assess(&self, _face: &FaceRegion) -> LivenessVerdict {
            LivenessVerdict::Spoof("printed photo".into())
        }
    }

    fn encode(image: RgbImage) -> ImageSource {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        ImageSource::Bytes(out.into_inner())
    }

    #[test]
    fn face_yields_embedding_of_configured_length() {
        let pipeline = FacePipeline::from_config(&ResolvedConfig::default());
        match pipeline.analyze(&encode(synthetic_face())).unwrap() {
            FaceAnalysis::Face { region, embedding } => {
                assert_eq!(embedding.len(), pipeline.extractor().embedding_len());
                assert!(region.confidence >= 0.2);
            }
            other => panic!("expected a face, got {other:?}"),
        }
    }

    #[test]
    fn blank_frame_is_no_face() {
        let pipeline = FacePipeline::from_config(&ResolvedConfig::default());
        let blank = encode(RgbImage::from_pixel(64, 64, Rgb([0, 0, 0])));
        assert!(matches!(
            pipeline.analyze(&blank).unwrap(),
            FaceAnalysis::NoFace
        ));
    }

    #[test]
    fn liveness_rejection_short_circuits_extraction() {
        let pipeline = FacePipeline::from_config(&ResolvedConfig::default())
            .with_liveness(Box::new(RejectAll));
        match pipeline.analyze(&encode(synthetic_face())).unwrap() {
            FaceAnalysis::Spoof(reason) => assert_eq!(reason, "printed photo"),
            other => panic!("expected a spoof verdict, got {other:?}"),
        }
    }
}
