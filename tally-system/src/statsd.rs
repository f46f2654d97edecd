use tally_statsd::GaugeMetric;

/// Gauges recorded by the service framework itself.
pub enum SystemGauges {
    /// The number of messages queued in a service channel.
    ///
    /// Tagged by `service`, the short name of the service. A sustained non-zero
    /// value means the service cannot keep up with its callers.
    ServiceBackPressure,
}

impl GaugeMetric for SystemGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::ServiceBackPressure => "service.back_pressure",
        }
    }
}
