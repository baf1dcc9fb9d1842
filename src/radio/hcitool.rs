//! Command templates for BlueZ `hcitool`/`hciconfig` and parsers for their
//! output.

/// Command line that succeeds only when `hcitool` is on the `PATH`.
pub const AVAILABILITY_COMMAND: &str = "command -v hcitool";

const RSSI_PREFIX: &str = "RSSI return value:";
const NAME_PREFIX: &str = "Device Name:";
const COMPANY_PREFIX: &str = "OUI Company:";

/// Command builder bound to one `hciN` adapter.
#[derive(Debug, Clone, Copy)]
pub struct HciTool {
    device_id: u32,
}

impl HciTool {
    pub fn new(device_id: u32) -> Self {
        Self { device_id }
    }

    /// Adapter name, e.g. `hci0`.
    pub fn interface(&self) -> String {
        format!("hci{}", self.device_id)
    }

    /// Open a connection to `address` and read its RSSI.
    pub fn rssi_command(&self, address: &str) -> String {
        let iface = self.interface();
        format!(
            "hcitool -i {iface} cc \"{address}\" && hcitool -i {iface} rssi \"{address}\""
        )
    }

    /// Query name and manufacturer of `address`.
    pub fn info_command(&self, address: &str) -> String {
        format!("hcitool -i {} info \"{}\"", self.interface(), address)
    }

    /// Reset the adapter after a hung query.
    pub fn reset_command(&self) -> String {
        format!("hciconfig {} reset", self.interface())
    }
}

/// Whether `address` is safe to template into a command line.
pub fn is_valid_address(address: &str) -> bool {
    !address.is_empty()
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_'))
}

/// Extract the value of an `RSSI return value: <n>` line.
pub fn parse_rssi(output: &str) -> Option<i32> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(RSSI_PREFIX)?;
        let rest = rest.trim_start();
        let end = rest
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        rest[..end].parse().ok()
    })
}

/// Identity fields reported by `hcitool info`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub manufacturer: Option<String>,
}

pub fn parse_device_info(output: &str) -> DeviceInfo {
    let mut info = DeviceInfo::default();

    for line in output.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix(NAME_PREFIX) {
            let name = name.trim();
            if !name.is_empty() {
                info.name = Some(name.to_string());
            }
        } else if let Some(company) = line.strip_prefix(COMPANY_PREFIX) {
            // "Apple, Inc. (00-1A-7D)"
            let company = company.split(" (").next().unwrap_or_default().trim();
            if !company.is_empty() {
                info.manufacturer = Some(company.to_string());
            }
        }
    }

    info
}
