//! Interface name → PHC index mapping via `SIOCETHTOOL` / `ETHTOOL_GET_TS_INFO`.
//!
//! Every pipeline that disciplines a PHC from a network timestamp source
//! needs to resolve "eth0" to "/dev/ptp3"; this is the one place that
//! does it, grounded directly on the kernel `ethtool_ts_info` ABI rather
//! than parsing `ethtool` command output.

use crate::error::{PtpdiscError, Result};
use std::os::unix::io::AsRawFd;

const SIOCETHTOOL: libc::c_ulong = 0x8946;
const ETHTOOL_GET_TS_INFO: u32 = 0x00000041;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct EthtoolTsInfo {
    cmd: u32,
    so_timestamping: u32,
    phc_index: i32,
    tx_types: u32,
    tx_reserved: [u32; 3],
    rx_filters: u32,
    rx_reserved: [u32; 3],
}

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_data: *mut libc::c_void,
}

/// Resolve a network interface name to the PHC device path that
/// timestamps its packets, e.g. `"eth0"` → `"/dev/ptp3"`.
pub fn phc_path_for_interface(ifname: &str) -> Result<String> {
    let index = phc_index_for_interface(ifname)?;
    if index < 0 {
        return Err(PtpdiscError::Config(format!(
            "interface {ifname} has no associated PHC"
        )));
    }
    Ok(format!("/dev/ptp{index}"))
}

fn phc_index_for_interface(ifname: &str) -> Result<i32> {
    if ifname.len() >= IFNAMSIZ {
        return Err(PtpdiscError::Config(format!(
            "interface name {ifname} exceeds IFNAMSIZ"
        )));
    }

    let sock = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)
        .map_err(|e| PtpdiscError::Device { path: ifname.to_string(), message: e.to_string() })?;

    let mut ts_info = EthtoolTsInfo {
        cmd: ETHTOOL_GET_TS_INFO,
        so_timestamping: 0,
        phc_index: -1,
        tx_types: 0,
        tx_reserved: [0; 3],
        rx_filters: 0,
        rx_reserved: [0; 3],
    };

    let mut ifr_name = [0 as libc::c_char; IFNAMSIZ];
    for (dst, src) in ifr_name.iter_mut().zip(ifname.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    let mut req = IfReq {
        ifr_name,
        ifr_data: &mut ts_info as *mut _ as *mut libc::c_void,
    };

    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), SIOCETHTOOL as _, &mut req) };
    if ret < 0 {
        return Err(PtpdiscError::device(
            ifname.to_string(),
            format!("SIOCETHTOOL/GET_TS_INFO failed: {}", std::io::Error::last_os_error()),
        ));
    }
    Ok(ts_info.phc_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name_too_long_is_rejected_before_any_syscall() {
        let err = phc_path_for_interface("this_name_is_way_too_long_for_ifnamsiz").unwrap_err();
        assert!(matches!(err, PtpdiscError::Config(_)));
    }
}
