//! Optional REST/health/metrics surface (§6), off by default and never
//! authenticated -- intended for loopback/cluster-internal use only. Every
//! handler here is a thin translator onto the same internal calls the XMPP
//! side uses; per SPEC_FULL §9 no business logic is duplicated here.

use std::sync::{atomic::{AtomicBool, Ordering}, Arc};

use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use jicofo_core::{BridgeRegistry, ConferenceRegistry, FocusIqHandler};
use jicofo_xmpp_parsers::conference_iq::{ConferenceIq, ConferenceRequest, ConferenceResponse, Ready};
use serde::Serialize;

pub struct AppState {
  pub bridges: Arc<BridgeRegistry>,
  pub conferences: Arc<ConferenceRegistry>,
  pub focus_iq: FocusIqHandler,
  /// Flipped to `false` if the primary XMPP connection's background task
  /// ever exits; read by `/about/health`.
  pub xmpp_alive: Arc<AtomicBool>,
}

#[get("/about/health")]
async fn health(state: web::Data<AppState>) -> impl Responder {
  let has_operational_bridge = state.bridges.snapshot().iter().any(|b| b.operational);
  let xmpp_alive = state.xmpp_alive.load(Ordering::Relaxed);
  if has_operational_bridge && xmpp_alive {
    HttpResponse::Ok().finish()
  }
  else {
    HttpResponse::ServiceUnavailable().finish()
  }
}

#[derive(Serialize)]
struct VersionResponse {
  name: &'static str,
  version: &'static str,
}

#[get("/about/version")]
async fn version() -> impl Responder {
  web::Json(VersionResponse { name: "jicofo", version: env!("CARGO_PKG_VERSION") })
}

#[get("/metrics")]
async fn metrics(state: web::Data<AppState>) -> impl Responder {
  let bridges = state.bridges.snapshot();
  let operational = bridges.iter().filter(|b| b.operational).count();
  let body = format!(
    "# TYPE jicofo_bridges_total gauge\n\
     jicofo_bridges_total {}\n\
     # TYPE jicofo_bridges_operational gauge\n\
     jicofo_bridges_operational {}\n\
     # TYPE jicofo_conferences_total gauge\n\
     jicofo_conferences_total {}\n",
    bridges.len(),
    operational,
    state.conferences.len(),
  );
  HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(body)
}

#[post("/conference-request/v1")]
async fn conference_request(state: web::Data<AppState>, body: web::Json<ConferenceRequest>) -> impl Responder {
  let request = body.into_inner();
  let Ok(room) = request.room.parse() else {
    return HttpResponse::BadRequest().body("invalid room JID");
  };
  let mut iq = ConferenceIq::request(room);
  if let Some(machine_uid) = request.machine_uid {
    iq = iq.with_machine_uid(machine_uid);
  }
  iq.properties = request
    .properties
    .into_iter()
    .map(|(name, value)| jicofo_xmpp_parsers::conference_iq::Property { name, value })
    .collect();
  let response = state.focus_iq.handle_request(iq);
  HttpResponse::Ok().json(ConferenceResponse {
    room: response.room.to_string(),
    ready: response.ready == Ready::True,
    properties: response.property_map(),
  })
}

#[derive(serde::Deserialize)]
struct MoveEndpointsQuery {
  bridge: String,
}

/// Operator action: evacuate every endpoint from `bridge` by withdrawing it
/// from the registry, which fires the same `Removed` event a failed health
/// check would, migrating every affected conference's participants.
#[get("/move-endpoints")]
async fn move_endpoints(state: web::Data<AppState>, query: web::Query<MoveEndpointsQuery>) -> impl Responder {
  let bridge_id = jicofo_core::BridgeId::from(query.into_inner().bridge);
  state.bridges.remove(&bridge_id);
  HttpResponse::Ok().finish()
}

pub async fn serve(host: &str, port: u16, state: web::Data<AppState>) -> std::io::Result<()> {
  HttpServer::new(move || {
    App::new()
      .app_data(state.clone())
      .service(health)
      .service(version)
      .service(metrics)
      .service(conference_request)
      .service(move_endpoints)
  })
  .bind((host, port))?
  .run()
  .await
}
