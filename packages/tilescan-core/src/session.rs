use geo_types::{Coord, Geometry, LineString, MultiPolygon, Polygon};
use serde_json::Value;
use tracing::{debug, info};

use crate::cancellation::{CancellationManager, CancellationToken};
use crate::error::PipelineError;
use crate::models::RunReport;
use crate::pipeline::Pipeline;
use crate::tiles::BoundingBox;

#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    PolygonDrawn { bbox: BoundingBox },
    Searching { bbox: BoundingBox, token: CancellationToken },
    ResultsReady { bbox: BoundingBox, report: RunReport },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::PolygonDrawn { .. } => "polygon-drawn",
            SessionState::Searching { .. } => "searching",
            SessionState::ResultsReady { .. } => "results-ready",
        }
    }

    pub fn bbox(&self) -> Option<&BoundingBox> {
        match self {
            SessionState::Idle => None,
            SessionState::PolygonDrawn { bbox }
            | SessionState::Searching { bbox, .. }
            | SessionState::ResultsReady { bbox, .. } => Some(bbox),
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    PolygonSubmitted(Geometry<f64>),
    SearchRequested,
    FetchCompleted(RunReport),
    FetchFailed { run_id: String, message: String },
}

/// A search started with [`Session::begin_search`]; run it with
/// [`Pipeline::run`] and hand the outcome to [`Session::complete_search`].
#[derive(Debug, Clone)]
pub struct SearchRun {
    pub bbox: BoundingBox,
    pub token: CancellationToken,
}

/// Drives one user's search: draw an area, search it, look at the results.
///
/// Submitting a new polygon from any state starts over and cancels a search
/// that is still running. Completions of superseded runs are dropped.
pub struct Session {
    key: String,
    state: SessionState,
    cancellations: CancellationManager,
    last_error: Option<String>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_manager(key, CancellationManager::new())
    }

    pub fn with_manager(key: impl Into<String>, cancellations: CancellationManager) -> Self {
        Self {
            key: key.into(),
            state: SessionState::Idle,
            cancellations,
            last_error: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Shared handle another task can use to cancel this session's search.
    pub fn cancellations(&self) -> CancellationManager {
        self.cancellations.clone()
    }

    pub fn report(&self) -> Option<&RunReport> {
        match &self.state {
            SessionState::ResultsReady { report, .. } => Some(report),
            _ => None,
        }
    }

    /// Apply one event. `SearchRequested` hands back the token of the new run.
    pub fn handle(&mut self, event: SessionEvent) -> Result<Option<CancellationToken>, PipelineError> {
        match event {
            SessionEvent::PolygonSubmitted(geometry) => {
                let bbox = BoundingBox::from_geometry(&geometry)?;
                if let SessionState::Searching { token, .. } = &self.state {
                    info!(run = %token.id, "polygon redrawn, cancelling running search");
                    token.cancel();
                    self.cancellations.cleanup_token(&self.key);
                }
                self.last_error = None;
                self.transition(SessionState::PolygonDrawn { bbox });
                Ok(None)
            }
            SessionEvent::SearchRequested => {
                let bbox = match &self.state {
                    SessionState::PolygonDrawn { bbox } | SessionState::ResultsReady { bbox, .. } => *bbox,
                    SessionState::Idle => {
                        return Err(PipelineError::InvalidTransition(
                            "draw a polygon before searching".into(),
                        ))
                    }
                    SessionState::Searching { .. } => {
                        return Err(PipelineError::InvalidTransition("a search is already running".into()))
                    }
                };
                let token = self.cancellations.create_token(&self.key);
                self.last_error = None;
                self.transition(SessionState::Searching {
                    bbox,
                    token: token.clone(),
                });
                Ok(Some(token))
            }
            SessionEvent::FetchCompleted(report) => {
                if let Some(bbox) = self.current_run_bbox(&report.run_id) {
                    self.cancellations.cleanup_token(&self.key);
                    self.transition(SessionState::ResultsReady { bbox, report });
                } else {
                    debug!(run = %report.run_id, "dropping results of a superseded run");
                }
                Ok(None)
            }
            SessionEvent::FetchFailed { run_id, message } => {
                if let Some(bbox) = self.current_run_bbox(&run_id) {
                    self.cancellations.cleanup_token(&self.key);
                    self.last_error = Some(message);
                    self.transition(SessionState::PolygonDrawn { bbox });
                } else {
                    debug!(run = %run_id, "dropping failure of a superseded run");
                }
                Ok(None)
            }
        }
    }

    fn current_run_bbox(&self, run_id: &str) -> Option<BoundingBox> {
        match &self.state {
            SessionState::Searching { bbox, token } if token.id == run_id => Some(*bbox),
            _ => None,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.key, from = self.state.name(), to = next.name(), "session transition");
        self.state = next;
    }

    /// Move to searching and hand out the run to execute. The session stays
    /// free while the run is in flight, so a redraw can cancel it.
    pub fn begin_search(&mut self) -> Result<SearchRun, PipelineError> {
        let token = self
            .handle(SessionEvent::SearchRequested)?
            .ok_or_else(|| PipelineError::InvalidTransition("search produced no run".into()))?;
        let bbox = *self
            .state
            .bbox()
            .ok_or_else(|| PipelineError::InvalidTransition("searching without an area".into()))?;
        Ok(SearchRun { bbox, token })
    }

    /// Record how `run` ended. Returns its report when the run is still the
    /// current one, and `None` when a redraw superseded it.
    pub fn complete_search(
        &mut self,
        run: &SearchRun,
        outcome: Result<RunReport, PipelineError>,
    ) -> Result<Option<&RunReport>, PipelineError> {
        match outcome {
            Ok(report) => {
                self.handle(SessionEvent::FetchCompleted(report))?;
                Ok(self.report().filter(|report| report.run_id == run.token.id))
            }
            Err(err) => {
                self.handle(SessionEvent::FetchFailed {
                    run_id: run.token.id.clone(),
                    message: err.to_string(),
                })?;
                Err(err)
            }
        }
    }

    /// Request a search, run it and record the outcome.
    ///
    /// The session is borrowed for the whole run, so only another holder of
    /// [`Session::cancellations`] can stop it. Use [`Session::begin_search`]
    /// when a redraw has to be able to interrupt the run.
    pub async fn search(&mut self, pipeline: &Pipeline) -> Result<&RunReport, PipelineError> {
        let run = self.begin_search()?;
        let outcome = pipeline.run(&run.bbox, &run.token).await;
        self.complete_search(&run, outcome)?
            .ok_or_else(|| PipelineError::Cancelled(run.token.id.clone()))
    }
}

/// Geometry of a drawn area given as GeoJSON. Accepts a Feature, a bare
/// Polygon or MultiPolygon, or a FeatureCollection whose last feature wins.
pub fn parse_drawn_area(geojson: &str) -> Result<Geometry<f64>, PipelineError> {
    let value: Value = serde_json::from_str(geojson)
        .map_err(|e| PipelineError::InvalidBoundingBox(format!("area is not valid GeoJSON: {}", e)))?;
    geometry_from_value(&value)
}

fn geometry_from_value(value: &Value) -> Result<Geometry<f64>, PipelineError> {
    let invalid = |msg: &str| PipelineError::InvalidBoundingBox(msg.to_string());
    match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => {
            let last = value
                .get("features")
                .and_then(Value::as_array)
                .and_then(|features| features.last())
                .ok_or_else(|| invalid("feature collection has no features"))?;
            geometry_from_value(last)
        }
        Some("Feature") => {
            let geometry = value.get("geometry").ok_or_else(|| invalid("feature has no geometry"))?;
            geometry_from_value(geometry)
        }
        Some("Polygon") => {
            let coordinates = value.get("coordinates").ok_or_else(|| invalid("polygon has no coordinates"))?;
            Ok(Geometry::Polygon(polygon_from(coordinates)?))
        }
        Some("MultiPolygon") => {
            let polygons = value
                .get("coordinates")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid("multipolygon has no coordinates"))?
                .iter()
                .map(polygon_from)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Geometry::MultiPolygon(MultiPolygon::new(polygons)))
        }
        Some(other) => Err(PipelineError::InvalidBoundingBox(format!(
            "unsupported area geometry {}",
            other
        ))),
        None => Err(invalid("area has no GeoJSON type")),
    }
}

fn polygon_from(coordinates: &Value) -> Result<Polygon<f64>, PipelineError> {
    let mut rings = coordinates
        .as_array()
        .ok_or_else(|| PipelineError::InvalidBoundingBox("polygon coordinates are not an array".into()))?
        .iter()
        .map(ring_from);
    let exterior = rings
        .next()
        .ok_or_else(|| PipelineError::InvalidBoundingBox("polygon has no rings".into()))??;
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn ring_from(ring: &Value) -> Result<LineString<f64>, PipelineError> {
    ring.as_array()
        .ok_or_else(|| PipelineError::InvalidBoundingBox("ring is not an array".into()))?
        .iter()
        .map(|position| match position.as_array().map(Vec::as_slice) {
            Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => Ok(Coord { x, y }),
                _ => Err(PipelineError::InvalidBoundingBox("non-numeric position".into())),
            },
            _ => Err(PipelineError::InvalidBoundingBox("position needs two numbers".into())),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::transport::fake::{FakeTransport, Reply};
    use geo_types::{LineString, Polygon};
    use std::sync::Arc;

    fn area(west: f64, south: f64, east: f64, north: f64) -> Geometry<f64> {
        Geometry::Polygon(Polygon::new(
            LineString::from(vec![
                (west, south),
                (east, south),
                (east, north),
                (west, north),
                (west, south),
            ]),
            vec![],
        ))
    }

    fn report_for(token: &CancellationToken) -> RunReport {
        RunReport {
            run_id: token.id.clone(),
            tiles_total: 1,
            features: vec![],
            tile_failures: vec![],
            enrich_stats: Default::default(),
        }
    }

    #[test]
    fn search_before_drawing_is_rejected() {
        let mut session = Session::new("s");
        let err = session.handle(SessionEvent::SearchRequested).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition(_)));
        assert_eq!(session.state().name(), "idle");
    }

    #[test]
    fn happy_path_reaches_results() {
        let mut session = Session::new("s");
        session
            .handle(SessionEvent::PolygonSubmitted(area(34.78, 32.05, 34.80, 32.09)))
            .unwrap();
        assert_eq!(session.state().name(), "polygon-drawn");

        let token = session.handle(SessionEvent::SearchRequested).unwrap().unwrap();
        assert_eq!(session.state().name(), "searching");
        assert!(matches!(
            session.handle(SessionEvent::SearchRequested),
            Err(PipelineError::InvalidTransition(_))
        ));

        session.handle(SessionEvent::FetchCompleted(report_for(&token))).unwrap();
        assert_eq!(session.state().name(), "results-ready");
        assert_eq!(session.report().unwrap().run_id, token.id);
        assert!(session.cancellations().get_token("s").is_none());

        // searching again from results is allowed
        assert!(session.handle(SessionEvent::SearchRequested).unwrap().is_some());
    }

    #[test]
    fn redraw_cancels_running_search_and_drops_its_results() {
        let mut session = Session::new("s");
        session
            .handle(SessionEvent::PolygonSubmitted(area(34.78, 32.05, 34.80, 32.09)))
            .unwrap();
        let token = session.handle(SessionEvent::SearchRequested).unwrap().unwrap();

        session
            .handle(SessionEvent::PolygonSubmitted(area(10.0, 10.0, 10.1, 10.1)))
            .unwrap();
        assert!(token.is_cancelled());
        assert_eq!(session.state().bbox().unwrap().west, 10.0);

        session.handle(SessionEvent::FetchCompleted(report_for(&token))).unwrap();
        assert_eq!(session.state().name(), "polygon-drawn");
        assert!(session.report().is_none());
    }

    #[test]
    fn failed_fetch_returns_to_drawn_with_error() {
        let mut session = Session::new("s");
        session
            .handle(SessionEvent::PolygonSubmitted(area(34.78, 32.05, 34.80, 32.09)))
            .unwrap();
        let token = session.handle(SessionEvent::SearchRequested).unwrap().unwrap();
        session
            .handle(SessionEvent::FetchFailed {
                run_id: token.id.clone(),
                message: "boom".into(),
            })
            .unwrap();
        assert_eq!(session.state().name(), "polygon-drawn");
        assert_eq!(session.last_error(), Some("boom"));
    }

    #[test]
    fn invalid_polygon_keeps_state() {
        let mut session = Session::new("s");
        session
            .handle(SessionEvent::PolygonSubmitted(area(34.78, 32.05, 34.80, 32.09)))
            .unwrap();
        let err = session
            .handle(SessionEvent::PolygonSubmitted(area(1.0, 1.0, 1.0, 1.0)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidBoundingBox(_)));
        assert_eq!(session.state().bbox().unwrap().west, 34.78);
    }

    #[tokio::test]
    async fn search_drives_pipeline() {
        let fake = Arc::new(FakeTransport::default());
        fake.route("map_features", vec![Reply::Json(200, r#"{"data":[]}"#.into())]);
        let pipeline = Pipeline::new(
            fake,
            PipelineConfig {
                api_base_url: "https://api.test".into(),
                zoom: 16,
                retry_delay_ms: 0,
                ..PipelineConfig::default()
            },
        )
        .unwrap();

        let mut session = Session::new("s");
        session
            .handle(SessionEvent::PolygonSubmitted(area(34.78, 32.05, 34.80, 32.09)))
            .unwrap();
        let report = session.search(&pipeline).await.unwrap();
        assert_eq!(report.tiles_total, 45);
        assert_eq!(session.state().name(), "results-ready");
    }

    #[test]
    fn last_drawn_feature_wins() {
        let geojson = r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]}},
            {"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[34.78,32.05],[34.80,32.05],[34.80,32.09],[34.78,32.09],[34.78,32.05]]]}}
        ]}"#;
        let geometry = parse_drawn_area(geojson).unwrap();
        let bbox = BoundingBox::from_geometry(&geometry).unwrap();
        assert_eq!(bbox, BoundingBox::new(34.78, 32.05, 34.80, 32.09).unwrap());
    }

    #[test]
    fn bare_geometry_and_bad_input() {
        let polygon = r#"{"type":"Polygon","coordinates":[[[1,1],[2,1],[2,2],[1,1]]]}"#;
        assert!(matches!(parse_drawn_area(polygon).unwrap(), Geometry::Polygon(_)));
        assert!(parse_drawn_area(r#"{"type":"FeatureCollection","features":[]}"#).is_err());
        assert!(parse_drawn_area(r#"{"type":"Feature","geometry":null}"#).is_err());
        assert!(parse_drawn_area(r#"{"type":"LineString","coordinates":[[0,0],[1,1]]}"#).is_err());
        assert!(parse_drawn_area("not json").is_err());
    }

    #[tokio::test]
    async fn redraw_interrupts_running_search() {
        let fake = Arc::new(FakeTransport::default());
        fake.route("map_features", vec![Reply::Hang]);
        let pipeline = Pipeline::new(
            fake,
            PipelineConfig {
                api_base_url: "https://api.test".into(),
                zoom: 16,
                request_timeout_ms: 60_000,
                ..PipelineConfig::default()
            },
        )
        .unwrap();

        let mut session = Session::new("s");
        session
            .handle(SessionEvent::PolygonSubmitted(area(34.78, 32.05, 34.80, 32.09)))
            .unwrap();
        let run = session.begin_search().unwrap();
        assert_eq!(session.state().name(), "searching");

        let redraw = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            session
                .handle(SessionEvent::PolygonSubmitted(area(10.0, 10.0, 10.1, 10.1)))
                .unwrap();
        };
        let (outcome, ()) = tokio::join!(pipeline.run(&run.bbox, &run.token), redraw);
        assert!(matches!(&outcome, Err(PipelineError::Cancelled(id)) if *id == run.token.id));

        assert!(session.complete_search(&run, outcome).is_err());
        // the stale failure does not touch the new area
        assert_eq!(session.state().name(), "polygon-drawn");
        assert_eq!(session.state().bbox().unwrap().west, 10.0);
        assert!(session.last_error().is_none());
    }
}
