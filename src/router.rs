// src/router.rs
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, warn};

use crate::http::{Method, Request, Response};
use crate::metrics::Metrics;
use crate::processor::RequestProcessor;

pub type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

struct Route {
    handler: Handler,
    /// The metrics endpoint is unmetered so that two back-to-back scrapes
    /// without other traffic report identical counters.
    metered: bool,
}

/// Dispatch table on (method, path). Paths compare exactly except for
/// registered prefixes, which match `/prefix<suffix>` with a non-empty
/// suffix.
pub struct Router {
    exact: HashMap<Method, HashMap<String, Route>>,
    prefixes: Vec<(Method, String, Route)>,
    metrics: Arc<Metrics>,
}

impl Router {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
            metrics,
        }
    }

    pub fn route<F>(&mut self, method: Method, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.exact.entry(method).or_default().insert(
            path.to_string(),
            Route {
                handler: Arc::new(handler),
                metered: true,
            },
        );
    }

    pub fn route_unmetered<F>(&mut self, method: Method, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.exact.entry(method).or_default().insert(
            path.to_string(),
            Route {
                handler: Arc::new(handler),
                metered: false,
            },
        );
    }

    pub fn route_prefix<F>(&mut self, method: Method, prefix: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.prefixes.push((
            method,
            prefix.to_string(),
            Route {
                handler: Arc::new(handler),
                metered: true,
            },
        ));
    }

    fn lookup(&self, method: Method, path: &str) -> Option<&Route> {
        if let Some(route) = self.exact.get(&method).and_then(|table| table.get(path)) {
            return Some(route);
        }
        self.prefixes
            .iter()
            .find(|(m, prefix, _)| *m == method && path.len() > prefix.len() && path.starts_with(prefix))
            .map(|(_, _, route)| route)
    }

    /// Route one request and account for it: request count, byte counts,
    /// duration, RPS stamp, success/failure by status. A panicking handler
    /// is mapped to a 500 without touching the connection.
    pub fn dispatch(&self, req: &Request) -> Response {
        let route = self.lookup(req.method, &req.path);
        let metered = route.map(|r| r.metered).unwrap_or(true);

        if metered {
            self.metrics.inc_requests();
            self.metrics.inc_bytes_received(req.body.len());
            self.metrics.record_request_instant();
        }
        let start = Instant::now();

        let response = match route {
            Some(route) => {
                let handler = route.handler.as_ref();
                match panic::catch_unwind(AssertUnwindSafe(|| handler(req))) {
                    Ok(resp) => resp,
                    Err(_) => {
                        warn!("handler panicked for {} {}", req.method.as_str(), req.path);
                        Response::internal_error()
                    }
                }
            }
            None => {
                debug!("no route for {} {}", req.method.as_str(), req.path);
                Response::not_found()
            }
        };

        if metered {
            self.metrics.observe_duration(start.elapsed());
            self.metrics.inc_bytes_sent(response.body.len());
            if response.status < 400 {
                self.metrics.inc_success();
            } else {
                self.metrics.inc_fail();
            }
        }
        response
    }
}

/// Wire up the full endpoint set against the shared registry and processor.
pub fn build_router(metrics: Arc<Metrics>, processor: Arc<RequestProcessor>) -> Router {
    let mut router = Router::new(Arc::clone(&metrics));

    router.route(Method::Get, "/health", |_req| {
        Response::ok_json(br#"{"status":"healthy","success":true}"#.to_vec())
    });

    {
        let metrics = Arc::clone(&metrics);
        router.route_unmetered(Method::Get, "/metrics", move |_req| {
            Response::metrics_text(metrics.render())
        });
    }

    {
        let processor = Arc::clone(&processor);
        router.route(Method::Get, "/numbers/sum", move |_req| {
            Response::ok_json(
                json!({
                    "total_numbers_sum": processor.total_sum(),
                    "success": true,
                })
                .to_string(),
            )
        });
    }

    {
        let processor = Arc::clone(&processor);
        router.route_prefix(Method::Get, "/numbers/sum/", move |req| {
            // Single cut: everything past the prefix is the client id, even
            // if it happens to contain the prefix text again.
            let client_id = &req.path["/numbers/sum/".len()..];
            Response::ok_json(
                json!({
                    "client_id": client_id,
                    "numbers_sum": processor.client_sum(client_id),
                    "success": true,
                })
                .to_string(),
            )
        });
    }

    {
        let processor = Arc::clone(&processor);
        router.route(Method::Get, "/numbers/sum-all", move |_req| {
            Response::ok_json(
                json!({
                    "success": true,
                    "clients": processor.all_client_sums(),
                    "total": processor.total_sum(),
                })
                .to_string(),
            )
        });
    }

    router.route(Method::Get, "/", |_req| {
        Response::ok_json(
            json!({
                "service": "tallyd JSON processing service",
                "version": env!("CARGO_PKG_VERSION"),
                "endpoints": {
                    "GET /": "API documentation",
                    "GET /health": "Service health check",
                    "GET /metrics": "Prometheus metrics",
                    "GET /numbers/sum": "Get total sum of all processed numbers",
                    "GET /numbers/sum/{client_id}": "Get sum of numbers for specific client",
                    "GET /numbers/sum-all": "Get sums for all clients",
                    "POST /process": "Process JSON record",
                },
            })
            .to_string(),
        )
    });

    {
        let processor = Arc::clone(&processor);
        router.route(Method::Post, "/process", move |req| {
            if req.body.is_empty() {
                warn!("empty request body on /process");
                return Response::bad_request(RequestProcessor::error_body("Empty request body"));
            }
            match processor.process(&req.body) {
                Ok(body) => Response::ok_json(body),
                Err(msg) => Response::bad_request(RequestProcessor::error_body(&msg)),
            }
        });
    }

    router
}
