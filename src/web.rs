use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use std::sync::Arc;

use crate::updater::{Updater, UpdaterHealth};

/// Shared with the HTTP handlers: the updaters whose healths are unioned
/// into the process health.
#[derive(Clone)]
pub struct State {
    updaters: Vec<Arc<dyn Updater>>,
}

impl State {
    pub fn new(updaters: Vec<Arc<dyn Updater>>) -> Self {
        Self { updaters }
    }
}

/// The union of the updater healths: any non-OK updater makes the process
/// unhealthy, with all reasons concatenated.
pub fn aggregate_health(updaters: &[Arc<dyn Updater>]) -> Result<(), String> {
    let reasons: Vec<String> = updaters
        .iter()
        .filter_map(|u| match u.health() {
            UpdaterHealth::Ok => None,
            UpdaterHealth::Unhealthy(reason) => Some(format!("{}: {reason}", u.name())),
        })
        .collect();
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(reasons.join("\n"))
    }
}

#[get("/health")]
async fn health(state: Data<State>, _req: HttpRequest) -> impl Responder {
    match aggregate_health(&state.updaters) {
        Ok(()) => HttpResponse::Ok().content_type("text/plain").body("ok\n"),
        Err(reasons) => HttpResponse::ServiceUnavailable()
            .content_type("text/plain")
            .body(format!("{reasons}\n")),
    }
}

#[get("/metrics")]
async fn metrics(_req: HttpRequest) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(crate::metrics::gather())
}

/// Bind the health/metrics surface. The returned server is awaited by main
/// alongside the controller.
pub fn serve(port: u16, state: State) -> std::io::Result<actix_web::dev::Server> {
    let data = Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(middleware::Logger::default().exclude("/health").exclude("/metrics"))
            .service(health)
            .service(metrics)
    })
    .bind(("0.0.0.0", port))?
    .shutdown_timeout(5)
    .run();
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::IngressEntry;
    use crate::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct StubUpdater {
        name: &'static str,
        health: Mutex<UpdaterHealth>,
    }

    #[async_trait]
    impl Updater for StubUpdater {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn update(&self, _: &[IngressEntry]) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn health(&self) -> UpdaterHealth {
            self.health.lock().clone()
        }
    }

    #[test]
    fn any_unhealthy_updater_fails_the_union() {
        let nginx = Arc::new(StubUpdater {
            name: "nginx",
            health: Mutex::new(UpdaterHealth::unhealthy(
                "nginx metrics are failing to update",
            )),
        });
        let attacher = Arc::new(StubUpdater {
            name: "attacher",
            health: Mutex::new(UpdaterHealth::Ok),
        });
        let updaters: Vec<Arc<dyn Updater>> = vec![nginx.clone(), attacher];

        let unhealthy = aggregate_health(&updaters).unwrap_err();
        assert!(unhealthy.contains("nginx metrics are failing to update"));

        // A successful scrape flips the process healthy again.
        *nginx.health.lock() = UpdaterHealth::Ok;
        assert!(aggregate_health(&updaters).is_ok());
    }
}
