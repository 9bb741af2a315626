//! Statsd metrics of the cache and the preloader.
//!
//! Metrics are dropped until [`configure_statsd`] installed a client. Emit them with the
//! [`metric!`](crate::metric) macro.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use cadence::prelude::*;
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

use crate::config::Metrics;

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// A statsd client that adds the configured custom tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd_client: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn count<'a>(&'a self, name: &'a str, value: i64, tags: &[(&'a str, &'a str)]) {
        self.send(self.statsd_client.count_with_tags(name, value), tags);
    }

    pub fn gauge<'a>(&'a self, name: &'a str, value: u64, tags: &[(&'a str, &'a str)]) {
        self.send(self.statsd_client.gauge_with_tags(name, value), tags);
    }

    pub fn time<'a>(&'a self, name: &'a str, value: Duration, tags: &[(&'a str, &'a str)]) {
        self.send(self.statsd_client.time_with_tags(name, value), tags);
    }

    fn send<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>, tags: &[(&'a str, &'a str)])
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.tags {
            metric = metric.with_tag(tag, value);
        }
        for &(tag, value) in tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Reports metrics to the statsd host in `config`, if there is one.
///
/// Only the first successful call installs a client.
pub fn configure_statsd(config: &Metrics) -> anyhow::Result<()> {
    let Some(ref host) = config.statsd else {
        return Ok(());
    };

    let addrs: Vec<_> = host
        .as_str()
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve statsd host `{host}`"))?
        .collect();

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    let client = MetricsClient {
        statsd_client: StatsdClient::from_sink(&config.prefix, sink),
        tags: config.custom_tags.clone(),
    };
    if METRICS_CLIENT.set(client).is_err() {
        tracing::warn!("Metrics were already configured, ignoring new statsd settings");
        return Ok(());
    }

    tracing::info!(host = %host, prefix = %config.prefix, "Reporting metrics to statsd");
    Ok(())
}

/// Invokes `f` with the installed client, or returns the default if metrics are not configured.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    METRICS_CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a metric with optional `key => value` tags.
///
/// ```
/// # use preloader_service::metric;
/// metric!(counter("preload.request") += 1, "status" => "hit");
/// metric!(gauge("cache.entries") = 12);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| client.count($id, $value, &[$(($k, $v)),*]))
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| client.gauge($id, $value, &[$(($k, $v)),*]))
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| client.time($id, $value, &[$(($k, $v)),*]))
    };
}
