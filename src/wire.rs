use serde::Deserialize;
use serde::Serialize;

/// Configuration handed to a client over the WebSocket in response to the
/// `getConfig` text frame. Field names are part of the wire protocol.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(rename = "Ip")]
    pub ip: String,
    #[serde(rename = "GWIp")]
    pub gw_ip: String,
    // Older servers omit the remaining fields; the client falls back to
    // defaults when they are absent.
    #[serde(rename = "Netmask", default)]
    pub netmask: String,
    #[serde(rename = "DNS", default)]
    pub dns: Vec<String>,
    #[serde(rename = "RoutePrefix", default)]
    pub route_prefix: Vec<String>,
}
