use http::{Method, StatusCode};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    requests: Family<RouteLabels, Counter>,
    responses: Family<StatusLabels, Counter>,
    durations: Family<RouteLabels, Histogram>,
}

/// Records the outcome of a single request.
pub(crate) struct ResponseObserver {
    start: time::Instant,
    labels: RouteLabels,
    responses: Family<StatusLabels, Counter>,
    durations: Family<RouteLabels, Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RouteLabels {
    route: &'static str,
    method: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StatusLabels {
    route: &'static str,
    method: &'static str,
    status: u16,
}

// === impl HttpMetrics ===

impl HttpMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::default();
        reg.register(
            "requests",
            "Total number of API requests received",
            requests.clone(),
        );

        let responses = Family::default();
        reg.register(
            "responses",
            "Total number of API responses sent, by status code",
            responses.clone(),
        );

        let durations = Family::<RouteLabels, Histogram>::new_with_constructor(|| {
            // Writes are bounded by the write timeout, so nothing should take longer than a few
            // seconds.
            Histogram::new([0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0])
        });
        reg.register_with_unit(
            "request_duration",
            "Histogram of API request latency",
            Unit::Seconds,
            durations.clone(),
        );

        Self {
            requests,
            responses,
            durations,
        }
    }

    pub(crate) fn start(&self, route: &'static str, method: &Method) -> ResponseObserver {
        let labels = RouteLabels {
            route,
            method: method_str(method),
        };
        self.requests.get_or_create(&labels).inc();
        ResponseObserver {
            start: time::Instant::now(),
            labels,
            responses: self.responses.clone(),
            durations: self.durations.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn responses(&self, route: &'static str, method: &Method, status: StatusCode) -> u64 {
        self.responses
            .get_or_create(&StatusLabels {
                route,
                method: method_str(method),
                status: status.as_u16(),
            })
            .get()
    }
}

impl Default for HttpMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl ResponseObserver ===

impl ResponseObserver {
    pub(crate) fn end(self, status: StatusCode) {
        let Self {
            start,
            labels,
            responses,
            durations,
        } = self;
        durations
            .get_or_create(&labels)
            .observe(start.elapsed().as_secs_f64());
        responses
            .get_or_create(&StatusLabels {
                route: labels.route,
                method: labels.method,
                status: status.as_u16(),
            })
            .inc();
    }
}

fn method_str(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::HEAD => "HEAD",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        Method::PATCH => "PATCH",
        Method::OPTIONS => "OPTIONS",
        _ => "OTHER",
    }
}
