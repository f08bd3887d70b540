//! 16-bit one's-complement internet checksum (RFC 1071)

use std::net::Ipv4Addr;

fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        // odd trailing byte is padded with zero on the right
        sum += u32::from(*last) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum over a raw byte range, used for IP and ICMP headers
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data))
}

/// TCP/UDP checksum including the IPv4 pseudo-header
pub fn transport_checksum(
    protocol: u8,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    segment: &[u8],
) -> u16 {
    let mut sum = sum_words(&source.octets());
    sum += sum_words(&destination.octets());
    sum += u32::from(protocol);
    sum += segment.len() as u32;
    sum += sum_words(segment);
    fold(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1071_reference_vector() {
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), 0x220d);
    }

    #[test]
    fn odd_length_pads_with_zero() {
        assert_eq!(checksum(&[0xab]), checksum(&[0xab, 0x00]));
    }

    #[test]
    fn verifies_to_zero_when_patched_in() {
        let mut data = vec![0x45, 0x00, 0x00, 0x28, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06];
        let csum = checksum(&data);
        data.extend_from_slice(&csum.to_be_bytes());
        assert_eq!(checksum(&data), 0);
    }
}
