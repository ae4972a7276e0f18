use std::net::IpAddr;

/// Add `data` to a running 16-bit one's complement sum, words taken in network byte order.
///
/// When chaining calls, every chunk but the last must have an even length.
pub fn ones_complement_add_by_16bit(data: &[u8], init: u16) -> u16 {
    let mut sum = init as u32;
    for (idx, v) in data.iter().enumerate() {
        if idx % 2 == 0 {
            sum += (*v as u32) << 8;
        } else {
            sum += *v as u32;
        }
        // keep room for the next additions
        if sum > 0xffff_0000 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }
    while (sum >> 16) > 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    return sum as u16;
}

/// Internet checksum (RFC 1071) of the concatenation of `chunks`.
pub fn checksum(chunks: &[&[u8]]) -> u16 {
    let mut sum = 0;
    for (idx, chunk) in chunks.iter().enumerate() {
        debug_assert!(idx + 1 == chunks.len() || chunk.len() % 2 == 0);
        sum = ones_complement_add_by_16bit(chunk, sum);
    }
    !sum
}

/// The TCP/ICMPv6 pseudo header, summed but not complemented.
pub fn pseudo_header_sum(src: IpAddr, dst: IpAddr, protocol: u8, upper_len: usize) -> u16 {
    let mut sum = 0;
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum = ones_complement_add_by_16bit(&src.octets(), sum);
            sum = ones_complement_add_by_16bit(&dst.octets(), sum);
            sum = ones_complement_add_by_16bit(&[0, protocol], sum);
            sum = ones_complement_add_by_16bit(&(upper_len as u16).to_be_bytes(), sum);
        }
        _ => {
            sum = ones_complement_add_by_16bit(&to_v6_octets(src), sum);
            sum = ones_complement_add_by_16bit(&to_v6_octets(dst), sum);
            sum = ones_complement_add_by_16bit(&(upper_len as u32).to_be_bytes(), sum);
            sum = ones_complement_add_by_16bit(&[0, 0, 0, protocol], sum);
        }
    }
    sum
}

fn to_v6_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
        IpAddr::V6(ip) => ip.octets(),
    }
}
