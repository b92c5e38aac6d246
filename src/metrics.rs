#[cfg(feature = "export-metrics")]
macro_rules! create_metrics {
    (
        $(
            $type:ident $name:ident
        ),*
        $(,)?
    ) => {
        use lazy_static::lazy_static;
        use metrics::{
            counter, gauge, histogram, Counter as counter, Gauge as gauge, Histogram as histogram,
        };

        lazy_static! {
            pub static ref METRICS: Metrics = Metrics::new();
        }

        pub struct Metrics {
            $(
                pub $name: $type,
            )*
        }

        impl Metrics {
            pub fn new() -> Self {
                Self {
                    $(
                        $name: $type!(
                            concat!("loss_bwe_", stringify!($name))
                        ),
                    )*
                }
            }
        }
    };
}

#[cfg(not(feature = "export-metrics"))]
macro_rules! create_metrics {
    (
        $(
            $type:ident $name:ident
        ),*
        $(,)?
    ) => {
        pub static METRICS: Metrics = Metrics::new();
        pub struct Dummy;
        impl Dummy {
            pub fn increment<T>(&self, _: T) {}
            pub fn record<T>(&self, _: T) {}
            pub fn set<T>(&self, _: T) {}
        }
        pub struct Metrics {
            $(
                pub $name: Dummy,
            )*
        }

        impl Metrics {
            pub const fn new() -> Self {
                Self {
                    $(
                        $name: Dummy,
                    )*
                }
            }
        }
    };
}

create_metrics!(
    counter feedback_batches,
    counter observations,
    counter backoffs,
    counter holds,
    gauge estimate_bps,
    gauge average_loss_ratio,
    gauge inherent_loss,
    histogram observation_span_ms,
);
