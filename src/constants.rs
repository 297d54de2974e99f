pub const STATUS_RX_ERR: &str = "Engine status channel closed while the host is alive";
