use std::env;
use std::time::Duration;

/// Environment prefix for runtime tunables.
const ENV_PREFIX: &str = "FABSEQ_";

/// Parameters governing the reliable endpoint core.
///
/// Every knob can be overridden from the environment with a `FABSEQ_`
/// prefix (`FABSEQ_MTU_SIZE`, `FABSEQ_TX_MAX_CREDITS`, ...). Booleans
/// accept `0`/`1`/`true`/`false`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum on-wire packet size the lower transport accepts.
    pub mtu_size: usize,
    /// Capacity of the logical TX entry pool.
    pub tx_size: usize,
    /// Capacity of the logical RX entry pool.
    pub rx_size: usize,
    /// Capacity of the fabric-side TX packet pool.
    pub tx_pkt_count: usize,
    /// Capacity of the fabric-side RX packet pool. Also the receive-buffer
    /// budget shared across peers for window grants.
    pub rx_pkt_count: usize,
    /// Capacity of the shm-side packet pools.
    pub shm_tx_pkt_count: usize,
    pub shm_rx_pkt_count: usize,
    /// Depth of the lower transport's send queue.
    pub max_outstanding_tx: usize,
    /// Optional cap on `max_outstanding_tx` (0 = use the lower's depth).
    pub tx_queue_size: usize,
    /// Per-peer credit ceiling on the sender side.
    pub tx_max_credits: u32,
    /// Floor applied to both credit requests and window grants so a
    /// transfer can always make progress.
    pub tx_min_credits: u32,
    /// Per-peer receive-buffer allowance, rationed down as fanout grows.
    pub rx_window_size: u32,
    /// Depth of the per-peer message-sequence reorder window.
    pub recvwin_size: usize,
    /// Completion queue capacity hint.
    pub cq_size: usize,
    /// Completions drained from the fabric CQ per progress tick.
    pub fabric_cq_read_size: usize,
    /// Completions drained from the shm CQ per progress tick.
    pub shm_cq_read_size: usize,
    /// Copy unexpected RTS packets into a dedicated pool so the posted
    /// receive buffer returns to the lower transport quickly.
    pub rx_copy_unexp: bool,
    /// Copy out-of-order packets into a dedicated pool.
    pub rx_copy_ooo: bool,
    /// Opportunistic shared-memory path for co-located peers.
    pub enable_shm_transfer: bool,
    /// Inline threshold for shm eager messages.
    pub shm_max_medium_size: usize,
    /// Segment length above which on-demand NIC registration replaces
    /// copying through the packet staging buffer.
    pub max_memcpy_size: usize,
    /// Deliver message starts in per-peer sequence order.
    pub in_order_delivery: bool,
    /// The lower transport requires local registration of packet buffers.
    pub mr_local: bool,
    /// Liveness fallback: reset the shared receive-buffer budget after
    /// this long at zero.
    pub available_data_bufs_timeout: Duration,
    /// Initial receiver-not-ready backoff interval.
    pub rnr_backoff_initial: Duration,
    /// Backoff ceiling.
    pub rnr_backoff_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu_size: 4096,
            tx_size: 512,
            rx_size: 1024,
            tx_pkt_count: 512,
            rx_pkt_count: 1024,
            shm_tx_pkt_count: 128,
            shm_rx_pkt_count: 256,
            max_outstanding_tx: 128,
            tx_queue_size: 0,
            tx_max_credits: 64,
            tx_min_credits: 4,
            rx_window_size: 128,
            recvwin_size: 16384,
            cq_size: 8192,
            fabric_cq_read_size: 50,
            shm_cq_read_size: 50,
            rx_copy_unexp: true,
            rx_copy_ooo: true,
            enable_shm_transfer: true,
            shm_max_medium_size: 4096,
            max_memcpy_size: 4096,
            in_order_delivery: true,
            mr_local: true,
            available_data_bufs_timeout: Duration::from_secs(5),
            rnr_backoff_initial: Duration::from_micros(100),
            rnr_backoff_max: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Defaults overridden by any `FABSEQ_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        read_usize("MTU_SIZE", &mut cfg.mtu_size);
        read_usize("TX_SIZE", &mut cfg.tx_size);
        read_usize("RX_SIZE", &mut cfg.rx_size);
        read_usize("TX_PKT_COUNT", &mut cfg.tx_pkt_count);
        read_usize("RX_PKT_COUNT", &mut cfg.rx_pkt_count);
        read_usize("SHM_TX_PKT_COUNT", &mut cfg.shm_tx_pkt_count);
        read_usize("SHM_RX_PKT_COUNT", &mut cfg.shm_rx_pkt_count);
        read_usize("MAX_OUTSTANDING_TX", &mut cfg.max_outstanding_tx);
        read_usize("TX_QUEUE_SIZE", &mut cfg.tx_queue_size);
        read_u32("TX_MAX_CREDITS", &mut cfg.tx_max_credits);
        read_u32("TX_MIN_CREDITS", &mut cfg.tx_min_credits);
        read_u32("RX_WINDOW_SIZE", &mut cfg.rx_window_size);
        read_usize("RECVWIN_SIZE", &mut cfg.recvwin_size);
        read_usize("CQ_SIZE", &mut cfg.cq_size);
        read_usize("FABRIC_CQ_READ_SIZE", &mut cfg.fabric_cq_read_size);
        read_usize("SHM_CQ_READ_SIZE", &mut cfg.shm_cq_read_size);
        read_bool("RX_COPY_UNEXP", &mut cfg.rx_copy_unexp);
        read_bool("RX_COPY_OOO", &mut cfg.rx_copy_ooo);
        read_bool("ENABLE_SHM_TRANSFER", &mut cfg.enable_shm_transfer);
        read_usize("SHM_MAX_MEDIUM_SIZE", &mut cfg.shm_max_medium_size);
        read_usize("MAX_MEMCPY_SIZE", &mut cfg.max_memcpy_size);
        read_bool("IN_ORDER_DELIVERY", &mut cfg.in_order_delivery);
        read_bool("MR_LOCAL", &mut cfg.mr_local);
        read_millis(
            "AVAILABLE_DATA_BUFS_TIMEOUT_MS",
            &mut cfg.available_data_bufs_timeout,
        );
        read_millis("RNR_BACKOFF_INITIAL_MS", &mut cfg.rnr_backoff_initial);
        read_millis("RNR_BACKOFF_MAX_MS", &mut cfg.rnr_backoff_max);
        cfg
    }
}

fn read_var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn read_usize(name: &str, out: &mut usize) {
    if let Some(v) = read_var(name).and_then(|v| v.parse().ok()) {
        *out = v;
    }
}

fn read_u32(name: &str, out: &mut u32) {
    if let Some(v) = read_var(name).and_then(|v| v.parse().ok()) {
        *out = v;
    }
}

fn read_bool(name: &str, out: &mut bool) {
    if let Some(v) = read_var(name) {
        *out = matches!(v.as_str(), "1" | "true" | "yes" | "on");
    }
}

fn read_millis(name: &str, out: &mut Duration) {
    if let Some(v) = read_var(name).and_then(|v| v.parse().ok()) {
        *out = Duration::from_millis(v);
    }
}
