use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub ledger_mutations_total: IntCounterVec,
    pub rewards_total: IntCounterVec,
    pub orders_total: IntCounterVec,
    pub outbox_dispatch_total: IntCounterVec,
    pub chat_replies_total: IntCounterVec,

    // Histograms
    pub chat_provider_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ledger_mutations_total = IntCounterVec::new(
            Opts::new("storefront_ledger_mutations_total", "Wallet money and points mutations"),
            &["kind", "result"], // kind: money|points, result: applied|replayed|rejected|error
        )?;

        let rewards_total = IntCounterVec::new(
            Opts::new("storefront_rewards_total", "Daily reward claims"),
            &["kind", "result"], // result: awarded|already_claimed|error
        )?;

        let orders_total = IntCounterVec::new(
            Opts::new("storefront_orders_total", "Order placement attempts"),
            &["payment_method", "result"],
        )?;

        let outbox_dispatch_total = IntCounterVec::new(
            Opts::new("storefront_outbox_dispatch_total", "Outbox event dispatch attempts"),
            &["event_type", "result"], // result: processed|retry|dead_lettered
        )?;

        let chat_replies_total = IntCounterVec::new(
            Opts::new("storefront_chat_replies_total", "Chat provider calls"),
            &["provider", "result"],
        )?;

        let chat_provider_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "storefront_chat_provider_duration_seconds",
                "Chat provider call duration seconds",
            ),
            &["provider"],
        )?;

        registry.register(Box::new(ledger_mutations_total.clone()))?;
        registry.register(Box::new(rewards_total.clone()))?;
        registry.register(Box::new(orders_total.clone()))?;
        registry.register(Box::new(outbox_dispatch_total.clone()))?;
        registry.register(Box::new(chat_replies_total.clone()))?;
        registry.register(Box::new(chat_provider_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            ledger_mutations_total,
            rewards_total,
            orders_total,
            outbox_dispatch_total,
            chat_replies_total,
            chat_provider_duration_seconds,
        })
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}
