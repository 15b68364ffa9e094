pub mod comparer;
pub mod detector;
pub mod enrollment;
pub mod extractor;
pub mod pipeline;
pub mod raster;
pub mod store;
pub mod verification;

pub use comparer::{cosine_similarity, MatchDecision};

pub use detector::{
    build_detector, BoundingBox, ClassicalDetector, DlibDetector, FaceCandidate, FaceDetector,
    FaceLocalizer, FaceRegion, FallbackDetector,
};

pub use enrollment::{
    run_enrollment, EnrollmentOutcome, EnrollmentPolicy, EnrollmentRejection, EnrollmentStatus,
};

pub use extractor::{blur_score, Embedding, ExtractionFailure, FeatureExtractor};

pub use pipeline::{FaceAnalysis, FacePipeline};

pub use raster::{normalize, RasterImage};

pub use store::{
    validate_identity, EnrollmentTemplate, FilesystemTemplateStore, MemoryTemplateStore,
    TemplateKey, TemplateMetadata, TemplateStore,
};

pub use verification::{
    run_verification, AttemptPolicy, VerificationAttempt, VerificationResult, VerificationState,
    VerificationStatus,
};
