// Author: Lukas Bower
// Purpose: Software TCP segmentation fallback and checksum resolution.

use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, IpAddress, IpProtocol, Ipv4Packet, TcpPacket, UdpPacket,
};

use crate::err::SegmentError;
use crate::frame::{Frame, DEFAULT_HEADROOM, ETH_HLEN, FCB_LEN};

/// Transport-layer facts needed to build the transmit control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOffsets {
    /// Offset from the frame start to the IP header.
    pub l3_off: u8,
    /// IP header length (distance from L3 to L4).
    pub l4_off: u8,
    /// Transport protocol is UDP.
    pub udp: bool,
    /// Current value of the transport checksum field, used as the
    /// pseudo-header seed by the checksum inserter.
    pub transport_csum: u16,
}

/// Inspect a frame's linear headers and report whether the hardware
/// checksum inserter can handle it. `None` means the protocol is not a
/// checksummable type and the request must be resolved in software.
#[must_use]
pub fn parse_tx_offsets(data: &[u8]) -> Option<TxOffsets> {
    let eth = EthernetFrame::new_checked(data).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    let ihl = usize::from(ip.header_len());
    let l4 = eth.payload().get(ihl..)?;
    let (udp, transport_csum) = match ip.next_header() {
        IpProtocol::Tcp => (false, TcpPacket::new_checked(l4).ok()?.checksum()),
        IpProtocol::Udp => (true, UdpPacket::new_checked(l4).ok()?.checksum()),
        _ => return None,
    };
    Some(TxOffsets {
        l3_off: ETH_HLEN as u8,
        l4_off: ihl as u8,
        udp,
        transport_csum,
    })
}

/// Fill the IP and transport checksums of a frame in software. Used when an
/// offload request cannot be honoured (unsupported protocol, or the
/// large-checksummed-frame erratum). Scatter fragments are flattened into
/// the linear region first, since header rewrites need contiguous bytes.
pub fn resolve_checksums(frame: &mut Frame) -> Result<(), SegmentError> {
    if !frame.fragments().is_empty() {
        flatten(frame);
    }
    let data = frame.data_mut();
    let mut eth = EthernetFrame::new_checked(&mut data[..]).map_err(|_| SegmentError::Malformed(0))?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return Err(SegmentError::NotSegmentable);
    }
    let payload = eth.payload_mut();
    let (src, dst, ihl, proto, total) = {
        let ip = Ipv4Packet::new_checked(&payload[..]).map_err(|_| SegmentError::Malformed(ETH_HLEN))?;
        (
            IpAddress::from(ip.src_addr()),
            IpAddress::from(ip.dst_addr()),
            usize::from(ip.header_len()),
            ip.next_header(),
            usize::from(ip.total_len()),
        )
    };
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut payload[..]);
        ip.fill_checksum();
    }
    let l4_end = total.min(payload.len());
    if l4_end <= ihl {
        return Err(SegmentError::Malformed(ETH_HLEN + ihl));
    }
    let l4 = &mut payload[ihl..l4_end];
    match proto {
        IpProtocol::Tcp => {
            let mut tcp = TcpPacket::new_unchecked(l4);
            tcp.fill_checksum(&src, &dst);
        }
        IpProtocol::Udp => {
            let mut udp = UdpPacket::new_unchecked(l4);
            udp.fill_checksum(&src, &dst);
        }
        _ => return Err(SegmentError::NotSegmentable),
    }
    Ok(())
}

/// Split an oversized TCP/IPv4 frame into MSS-sized segments.
///
/// Pure with respect to the input: every segment's headers are computed from
/// the original headers plus an offset, so segments can be inspected or
/// resubmitted independently. The IP identification field increments per
/// segment, the TCP sequence number advances by the payload carried, FIN and
/// PSH are deferred to the final segment, and both checksums are refilled
/// from scratch.
pub fn segment(frame: &Frame, mss: usize) -> Result<Vec<Frame>, SegmentError> {
    if mss == 0 {
        return Err(SegmentError::ZeroMss);
    }
    let data = frame.to_contiguous();

    let eth = EthernetFrame::new_checked(&data[..]).map_err(|_| SegmentError::Malformed(0))?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return Err(SegmentError::NotSegmentable);
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).map_err(|_| SegmentError::Malformed(ETH_HLEN))?;
    if ip.next_header() != IpProtocol::Tcp || ip.more_frags() || ip.frag_offset() != 0 {
        return Err(SegmentError::NotSegmentable);
    }
    let src = IpAddress::from(ip.src_addr());
    let dst = IpAddress::from(ip.dst_addr());
    let ihl = usize::from(ip.header_len());
    let ident = ip.ident();

    let l4_end = (ETH_HLEN + usize::from(ip.total_len())).min(data.len());
    let tcp = TcpPacket::new_checked(&data[ETH_HLEN + ihl..l4_end])
        .map_err(|_| SegmentError::Malformed(ETH_HLEN + ihl))?;
    // Data-offset field, in 32-bit words.
    let thl = usize::from(data[ETH_HLEN + ihl + 12] >> 4) * 4;
    let seq = tcp.seq_number();

    let hdr_len = ETH_HLEN + ihl + thl;
    if l4_end <= hdr_len {
        return Err(SegmentError::NotSegmentable);
    }
    let payload = &data[hdr_len..l4_end];

    let chunk_count = payload.len().div_ceil(mss);
    let mut out = Vec::with_capacity(chunk_count);
    for (i, chunk) in payload.chunks(mss).enumerate() {
        let last = i == chunk_count - 1;

        let mut seg = Vec::with_capacity(hdr_len + chunk.len());
        seg.extend_from_slice(&data[..hdr_len]);
        seg.extend_from_slice(chunk);

        {
            let mut seg_ip = Ipv4Packet::new_unchecked(&mut seg[ETH_HLEN..]);
            seg_ip.set_total_len((ihl + thl + chunk.len()) as u16);
            seg_ip.set_ident(ident.wrapping_add(i as u16));
            seg_ip.fill_checksum();
        }
        {
            let mut seg_tcp = TcpPacket::new_unchecked(&mut seg[ETH_HLEN + ihl..]);
            seg_tcp.set_seq_number(seq + i * mss);
            if !last {
                seg_tcp.set_fin(false);
                seg_tcp.set_psh(false);
            }
            seg_tcp.fill_checksum(&src, &dst);
        }

        let mut seg_frame = Frame::with_headroom(FCB_LEN + DEFAULT_HEADROOM, &seg);
        seg_frame.meta.vlan = frame.meta.vlan;
        out.push(seg_frame);
    }
    Ok(out)
}

fn flatten(frame: &mut Frame) {
    let meta = frame.meta;
    let headroom = frame.headroom();
    let all = frame.to_contiguous();
    let mut flat = Frame::with_headroom(headroom, &all);
    flat.meta = meta;
    *frame = flat;
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::Ipv4Address;

    /// Assemble a syntactically valid TCP/IPv4 frame with correct checksums.
    pub(crate) fn tcp_frame(payload: &[u8], fin: bool) -> Vec<u8> {
        let ihl = 20;
        let thl = 20;
        let total = ihl + thl + payload.len();
        let mut bytes = vec![0u8; ETH_HLEN + total];

        bytes[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 2]);
        bytes[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        bytes[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

        let src = Ipv4Address::new(10, 0, 0, 1);
        let dst = Ipv4Address::new(10, 0, 0, 2);
        // Version 4, 5-word header.
        bytes[ETH_HLEN] = 0x45;
        // TCP data offset, in 32-bit words.
        bytes[ETH_HLEN + ihl + 12] = ((thl / 4) as u8) << 4;
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut bytes[ETH_HLEN..]);
            ip.set_total_len(total as u16);
            ip.set_ident(0x100);
            ip.set_hop_limit(64);
            ip.set_next_header(IpProtocol::Tcp);
            ip.set_src_addr(src);
            ip.set_dst_addr(dst);
            ip.fill_checksum();
        }
        {
            let mut tcp = TcpPacket::new_unchecked(&mut bytes[ETH_HLEN + ihl..]);
            tcp.set_src_port(4000);
            tcp.set_dst_port(80);
            tcp.set_seq_number(smoltcp::wire::TcpSeqNumber(1_000));
            tcp.set_ack_number(smoltcp::wire::TcpSeqNumber(0));
            tcp.set_window_len(8_192);
            tcp.set_syn(false);
            tcp.set_fin(fin);
            tcp.set_psh(true);
            tcp.set_ack(true);
            tcp.fill_checksum(&src.into(), &dst.into());
        }
        bytes
    }

    #[test]
    fn splits_payload_and_advances_headers() {
        let wire = tcp_frame(&[0xABu8; 100], true);
        let frame = Frame::with_headroom(0, &wire);
        let segs = segment(&frame, 40).expect("segmentable");
        assert_eq!(segs.len(), 3);

        for (i, seg) in segs.iter().enumerate() {
            let eth = EthernetFrame::new_checked(seg.data()).expect("eth");
            let ip = Ipv4Packet::new_checked(eth.payload()).expect("ip");
            assert!(ip.verify_checksum(), "segment {i} ip checksum");
            assert_eq!(ip.ident(), 0x100 + i as u16);

            let tcp = TcpPacket::new_checked(&eth.payload()[20..]).expect("tcp");
            assert!(
                tcp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into()),
                "segment {i} tcp checksum"
            );
            assert_eq!(tcp.seq_number().0, 1_000 + (i as i32) * 40);
            let expect_len = if i == 2 { 20 } else { 40 };
            assert_eq!(usize::from(ip.total_len()), 20 + 20 + expect_len);
            // FIN and PSH only survive on the final segment.
            assert_eq!(tcp.fin(), i == 2, "segment {i} fin");
            assert_eq!(tcp.psh(), i == 2, "segment {i} psh");
        }
    }

    #[test]
    fn rejects_non_tcp_and_zero_mss() {
        let frame = Frame::with_headroom(0, &[0u8; 64]);
        assert_eq!(segment(&frame, 0).unwrap_err(), SegmentError::ZeroMss);
        assert_eq!(
            segment(&frame, 100).unwrap_err(),
            SegmentError::NotSegmentable
        );
    }

    #[test]
    fn segments_reassemble_to_original_payload() {
        let payload: Vec<u8> = (0..=254u8).collect();
        let wire = tcp_frame(&payload, false);
        let frame = Frame::with_headroom(0, &wire);
        let segs = segment(&frame, 64).expect("segmentable");

        let mut rebuilt = Vec::new();
        for seg in &segs {
            rebuilt.extend_from_slice(&seg.data()[ETH_HLEN + 40..]);
        }
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn offsets_identify_checksummable_frames() {
        let wire = tcp_frame(b"hello", false);
        let offs = parse_tx_offsets(&wire).expect("tcp frame");
        assert_eq!(offs.l3_off, ETH_HLEN as u8);
        assert_eq!(offs.l4_off, 20);
        assert!(!offs.udp);
        assert!(parse_tx_offsets(&[0u8; 40]).is_none());
    }

    #[test]
    fn resolve_checksums_fixes_corrupted_fields() {
        let mut wire = tcp_frame(b"payload", false);
        // Corrupt both checksums.
        wire[ETH_HLEN + 10] ^= 0xff;
        wire[ETH_HLEN + 20 + 16] ^= 0xff;
        let mut frame = Frame::with_headroom(0, &wire);
        resolve_checksums(&mut frame).expect("resolvable");

        let eth = EthernetFrame::new_checked(frame.data()).expect("eth");
        let ip = Ipv4Packet::new_checked(eth.payload()).expect("ip");
        assert!(ip.verify_checksum());
        let tcp = TcpPacket::new_checked(&eth.payload()[20..]).expect("tcp");
        assert!(tcp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into()));
    }
}
