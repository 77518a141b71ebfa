// Tiled feature aggregation and detection decoding for street-level imagery APIs

// Error types shared by every stage
pub mod error;
// Pipeline configuration (TOML + environment)
pub mod config;
// Shared data structures
pub mod models;
// Slippy-map tile math and bbox decomposition
pub mod tiles;
// Vector-tile detection decoding
pub mod detections;
// HTTP seam
pub mod transport;
// Retrying feature client
pub mod client;
// Per-tile result aggregation
pub mod aggregate;
// Sprite lookup for category tags
pub mod symbols;
// Image, detection and symbol enrichment
pub mod enrich;
// Run cancellation
pub mod cancellation;
// End-to-end run driver
pub mod pipeline;
// Draw-search-results state machine
pub mod session;
// Detection overlays and zip export
pub mod render;

pub use cancellation::{CancellationManager, CancellationToken};
pub use config::PipelineConfig;
pub use error::{PipelineError, TransportError, TransportErrorKind};
pub use models::{Detection, Feature, ImageDescriptor, RunReport};
pub use pipeline::Pipeline;
pub use render::{export_archive, Renderer};
pub use session::{parse_drawn_area, SearchRun, Session, SessionEvent, SessionState};
pub use tiles::{BoundingBox, TileCoordinate};
pub use transport::{HttpResponse, ReqwestTransport, Transport};
