use std::sync::{Arc, Mutex};
use storeguard::telemetry::MemorySink;
use storeguard::{
    CircuitBreaker, CircuitBreakerConfig, InMemoryStore, LimiterSettings, ManualClock,
    RateLimiter, StaticConfigProvider,
};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// A breaker and limiter over an in-memory store, all driven by one manual clock.
pub struct Fixture {
    pub store: InMemoryStore,
    pub clock: ManualClock,
    pub events: MemorySink,
    pub breaker: Arc<CircuitBreaker>,
    pub provider: StaticConfigProvider,
    pub limiter: Arc<RateLimiter>,
}

pub async fn fixture(breaker_config: CircuitBreakerConfig, settings: LimiterSettings) -> Fixture {
    let clock = ManualClock::default();
    let store = InMemoryStore::with_clock(clock.clone());
    let events = MemorySink::new();
    let breaker = Arc::new(
        CircuitBreaker::with_parts(
            Arc::new(store.clone()),
            breaker_config,
            Arc::new(clock.clone()),
            Arc::new(events.clone()),
        )
        .expect("valid breaker config"),
    );
    let provider = StaticConfigProvider::new(settings);
    let limiter = Arc::new(
        RateLimiter::from_provider(breaker.clone(), Arc::new(provider.clone()))
            .await
            .expect("valid limiter settings")
            .with_event_sink(Arc::new(events.clone())),
    );
    Fixture { store, clock, events, breaker, provider, limiter }
}

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captured log output for the current thread while the guard is alive.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
    }
}

pub fn capture_logs() -> LogCapture {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
        .with_target(true)
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    LogCapture { buffer, _guard: guard }
}
