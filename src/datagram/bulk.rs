//! Reliable transfer of messages that are too big for the small-message path. This is a
//!  receiver-driven selective repeat protocol:
//!
//! * The message is split into packets of `max_payload_size()` bytes (the last packet holds the
//!   remainder), and each packet goes into a datagram of its own, prefixed with its packet number
//!   as an i32.
//! * The sender sends all packets in the current send set (initially all packets), and then waits
//!   for the receiver's report of missing packets: an i32 count, followed by that many i32 packet
//!   numbers if the count is not zero. The missing packets become the next round's send set.
//!   A count of zero means the receiver has everything, and the sender finishes by sending
//!   [END_OF_TRANSMISSION].
//! * The receiver waits for the first packet without a time limit. After that, it waits
//!   `next_packet_timeout` for each next packet. When that expires, it reports all packets that
//!   are still missing and goes back to waiting without a time limit until the next packet
//!   arrives. Once all packets are there, it reports a count of zero and drains datagrams until
//!   END_OF_TRANSMISSION arrives, or until no datagram arrives for `end_of_transmission_timeout`.
//!
//! Control messages (counts, packet number lists and END_OF_TRANSMISSION) go over the
//!  small-message path and are not protected against loss. Loss detection relies on at least one
//!  packet of each round arriving: if all packets of a round are lost, both sides wait forever.

use std::ops::Range;
use bit_set::BitSet;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};
use crate::config::ProbeConfig;
use crate::datagram::{recv_small, send_small, DatagramChannel};
use crate::error::ProtocolError;
use crate::util::buf::{BufExt, BufMutExt, I32_SIZE};

/// every bulk transfer datagram starts with the packet number as an i32
pub const PACKET_NUMBER_SIZE: usize = I32_SIZE;

/// Sent by the bulk transfer sender after the receiver reported that it has all packets. This
///  can never be confused with a count of missing packets.
pub const END_OF_TRANSMISSION: i32 = -2;

/// Counters for one bulk transfer, from the perspective of the side that returned them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkTransferStats {
    /// number of send rounds (sender) or waits for a round of packets (receiver)
    pub rounds: usize,
    /// data packets sent (sender) or received (receiver), duplicates included
    pub packets: usize,
    /// packets that were received again after they had arrived already
    pub duplicates: usize,
    /// resend requests issued (receiver) or served (sender)
    pub resend_requests: usize,
}

/// packet boundaries of a message
struct PacketLayout {
    len: usize,
    max_payload_size: usize,
    packet_count: usize,
}

impl PacketLayout {
    fn new(len: usize, max_payload_size: usize) -> anyhow::Result<PacketLayout> {
        let packet_count = len.div_ceil(max_payload_size);
        if i32::try_from(packet_count).is_err() {
            return Err(ProtocolError::violation(format!("message of {} bytes needs more packets than can be numbered", len)).into());
        }
        Ok(PacketLayout {
            len,
            max_payload_size,
            packet_count,
        })
    }

    fn range(&self, packet_number: usize) -> Range<usize> {
        let start = packet_number * self.max_payload_size;
        start..self.len.min(start + self.max_payload_size)
    }

    fn packet_number(&self, raw: i32) -> Option<usize> {
        usize::try_from(raw).ok()
            .filter(|&n| n < self.packet_count)
    }
}

/// The receiver's set of packets that did not arrive yet
pub struct PendingPackets {
    pending: BitSet,
}

impl PendingPackets {
    pub fn new(packet_count: usize) -> PendingPackets {
        let mut pending = BitSet::with_capacity(packet_count);
        for packet_number in 0..packet_count {
            pending.insert(packet_number);
        }
        PendingPackets { pending }
    }

    /// returns `false` if the packet was not pending, i.e. it is a duplicate
    pub fn on_received(&mut self, packet_number: usize) -> bool {
        self.pending.remove(packet_number)
    }

    pub fn is_pending(&self, packet_number: usize) -> bool {
        self.pending.contains(packet_number)
    }

    pub fn len(&self) -> usize {
        self.pending.count()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// pending packet numbers in ascending order
    pub fn to_vec(&self) -> Vec<i32> {
        self.pending.iter()
            .map(|n| n as i32)
            .collect()
    }
}

async fn send_control_i32<C: DatagramChannel + ?Sized>(channel: &C, config: &ProbeConfig, value: i32) -> anyhow::Result<()> {
    send_small(channel, &value.to_be_bytes(), config.max_datagram_size).await
}

async fn recv_control_i32<C: DatagramChannel + ?Sized>(channel: &C, config: &ProbeConfig) -> anyhow::Result<i32> {
    let mut buf = [0u8; I32_SIZE];
    recv_small(channel, &mut buf, config.max_datagram_size).await?;
    (&mut &buf[..]).checked_get_i32()
}

/// Send `data` to a peer that calls [recv_bulk] with a buffer of the same length, returning when
///  the peer confirmed it received everything.
pub async fn send_bulk<C: DatagramChannel + ?Sized>(channel: &C, config: &ProbeConfig, data: &[u8]) -> anyhow::Result<BulkTransferStats> {
    let layout = PacketLayout::new(data.len(), config.max_payload_size())?;
    let mut stats = BulkTransferStats::default();

    let mut send_set = (0..layout.packet_count).collect::<Vec<_>>();
    let mut datagram = BytesMut::with_capacity(config.max_datagram_size);
    loop {
        stats.rounds += 1;
        debug!("bulk send round {}: sending {} of {} packets", stats.rounds, send_set.len(), layout.packet_count);

        for &packet_number in &send_set {
            datagram.clear();
            datagram.put_i32(packet_number as i32);
            datagram.put_slice(&data[layout.range(packet_number)]);
            channel.send_datagram(&datagram).await?;
            stats.packets += 1;
        }

        let num_missing = recv_control_i32(channel, config).await?;
        if num_missing == 0 {
            break;
        }
        let num_missing = usize::try_from(num_missing).ok()
            .filter(|&n| n <= layout.packet_count)
            .ok_or_else(|| ProtocolError::violation(format!("receiver reported {} missing packets of {}", num_missing, layout.packet_count)))?;

        let mut raw = vec![0u8; num_missing * I32_SIZE];
        recv_small(channel, &mut raw, config.max_datagram_size).await?;
        let requested = (&mut &raw[..]).checked_get_i32_list()?;

        send_set = requested.into_iter()
            .map(|raw| layout.packet_number(raw)
                .ok_or_else(|| ProtocolError::violation(format!("resend requested for packet {} of {}", raw, layout.packet_count))))
            .collect::<Result<Vec<_>, _>>()?;
        stats.resend_requests += 1;
        trace!("receiver requested packets {:?}", send_set);
    }

    send_control_i32(channel, config, END_OF_TRANSMISSION).await?;
    debug!("bulk send of {} bytes complete: {:?}", data.len(), stats);
    Ok(stats)
}

/// Receive a message sent with [send_bulk] into `buf`. The buffer's length must be the length
///  of the message.
pub async fn recv_bulk<C: DatagramChannel + ?Sized>(channel: &C, config: &ProbeConfig, buf: &mut [u8]) -> anyhow::Result<BulkTransferStats> {
    let layout = PacketLayout::new(buf.len(), config.max_payload_size())?;
    let mut pending = PendingPackets::new(layout.packet_count);
    let mut stats = BulkTransferStats {
        rounds: 1,
        ..Default::default()
    };

    let mut datagram = vec![0u8; config.max_datagram_size];
    let mut timeout = None;
    while !pending.is_empty() {
        let Some(len) = channel.recv_datagram(&mut datagram, timeout).await? else {
            let missing = pending.to_vec();
            debug!("no packet for {:?}, requesting {} missing packets", config.next_packet_timeout, missing.len());
            send_resend_request(channel, config, &missing).await?;
            stats.resend_requests += 1;
            stats.rounds += 1;
            timeout = None;
            continue;
        };
        timeout = Some(config.next_packet_timeout);

        let received = &datagram[..len];
        if received.len() <= PACKET_NUMBER_SIZE {
            warn!("ignoring datagram of {} bytes during bulk receive", received.len());
            continue;
        }
        let (raw_packet_number, payload) = received.split_at(PACKET_NUMBER_SIZE);
        let raw_packet_number = i32::from_be_bytes(raw_packet_number.try_into()?);

        let Some(packet_number) = layout.packet_number(raw_packet_number) else {
            warn!("ignoring packet number {} outside of 0..{}", raw_packet_number, layout.packet_count);
            continue;
        };
        let range = layout.range(packet_number);
        if payload.len() != range.len() {
            warn!("ignoring packet {} with {} bytes of payload, expected {}", packet_number, payload.len(), range.len());
            continue;
        }

        stats.packets += 1;
        if pending.is_pending(packet_number) {
            buf[range].copy_from_slice(payload);
            pending.on_received(packet_number);
            trace!("received packet {}, {} pending", packet_number, pending.len());
        }
        else {
            trace!("ignoring duplicate packet {}", packet_number);
            stats.duplicates += 1;
        }
    }

    send_control_i32(channel, config, 0).await?;
    drain_until_end_of_transmission(channel, config).await;

    debug!("bulk receive of {} bytes complete: {:?}", buf.len(), stats);
    Ok(stats)
}

async fn send_resend_request<C: DatagramChannel + ?Sized>(channel: &C, config: &ProbeConfig, missing: &[i32]) -> anyhow::Result<()> {
    send_control_i32(channel, config, missing.len() as i32).await?;

    let mut raw = BytesMut::with_capacity(missing.len() * I32_SIZE);
    raw.put_i32_list(missing);
    send_small(channel, &raw, config.max_datagram_size).await
}

/// The message is complete at this point, so failures here are only logged
async fn drain_until_end_of_transmission<C: DatagramChannel + ?Sized>(channel: &C, config: &ProbeConfig) {
    let mut datagram = vec![0u8; config.max_datagram_size];
    loop {
        match channel.recv_datagram(&mut datagram, Some(config.end_of_transmission_timeout)).await {
            Ok(Some(len)) if datagram[..len] == END_OF_TRANSMISSION.to_be_bytes() => {
                trace!("received END_OF_TRANSMISSION");
                return;
            }
            Ok(Some(len)) => {
                trace!("draining datagram of {} bytes", len);
            }
            Ok(None) => {
                debug!("no END_OF_TRANSMISSION within {:?}, the sender moved on", config.end_of_transmission_timeout);
                return;
            }
            Err(e) => {
                warn!("failed to receive END_OF_TRANSMISSION: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use mockall::Sequence;
    use rand::{Rng, RngCore, SeedableRng};
    use rand::rngs::StdRng;
    use rstest::rstest;
    use crate::datagram::MockDatagramChannel;
    use crate::test_util::MemoryChannel;

    fn payload(len: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(len as u64);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    }

    fn packet_number_of(datagram: &[u8]) -> Option<i32> {
        if datagram.len() > PACKET_NUMBER_SIZE {
            Some(i32::from_be_bytes(datagram[..4].try_into().unwrap()))
        }
        else {
            None
        }
    }

    /// Drops data packets on their first `n` attempts, where `n` is given per packet number.
    ///  Control messages pass unharmed.
    fn drop_attempts(drops: HashMap<i32, usize>) -> impl FnMut(&[u8]) -> bool + Send + 'static {
        let mut attempts = HashMap::<i32, usize>::new();
        move |datagram| {
            let Some(packet_number) = packet_number_of(datagram) else {
                return false;
            };
            let attempt = attempts.entry(packet_number).or_default();
            *attempt += 1;
            *attempt <= drops.get(&packet_number).copied().unwrap_or(0)
        }
    }

    async fn transfer(config: ProbeConfig, data: &[u8], sender: MemoryChannel, receiver: MemoryChannel) -> (BulkTransferStats, BulkTransferStats, MemoryChannel) {
        let send_config = config.clone();
        let data_to_send = data.to_vec();
        let send_task = tokio::spawn(async move {
            let stats = send_bulk(&sender, &send_config, &data_to_send).await.unwrap();
            (stats, sender)
        });

        let mut buf = vec![0u8; data.len()];
        let recv_stats = recv_bulk(&receiver, &config, &mut buf).await.unwrap();
        let (send_stats, sender) = send_task.await.unwrap();

        assert_eq!(buf, data);
        (send_stats, recv_stats, sender)
    }

    #[rstest]
    #[case::single_packet(100, vec![])]
    #[case::exact_packets(508*10, vec![])]
    #[case::remainder(508*10 + 7, vec![])]
    #[case::lose_first(5000, vec![(0, 1)])]
    #[case::lose_last(5000, vec![(9, 1)])]
    #[case::lose_middle(5000, vec![(3, 1), (4, 1), (6, 1)])]
    #[case::lose_repeatedly(5000, vec![(2, 2), (7, 1)])]
    #[case::lose_all_but_one(5000, vec![(1,1), (2,1), (3,1), (4,1), (5,1), (6,1), (7,1), (8,1), (9,1)])]
    #[case::large(200_000, vec![(0, 1), (100, 2), (393, 1)])]
    #[tokio::test(start_paused = true)]
    async fn test_lossy_transfer(#[case] len: usize, #[case] drops: Vec<(i32, usize)>) {
        let config = ProbeConfig::default();
        let data = payload(len);

        let max_drops = drops.iter().map(|(_, n)| *n).max().unwrap_or(0);
        let total_drops = drops.iter().map(|(_, n)| *n).sum::<usize>();

        let (sender, receiver) = MemoryChannel::pair();
        let sender = sender.with_drop_filter(drop_attempts(drops.into_iter().collect()));

        let (send_stats, recv_stats, _) = transfer(config, &data, sender, receiver).await;

        let packet_count = len.div_ceil(508);
        assert_eq!(send_stats.rounds, max_drops + 1);
        assert_eq!(send_stats.packets, packet_count + total_drops);
        assert_eq!(recv_stats.packets, packet_count);
        assert_eq!(recv_stats.resend_requests, max_drops);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resends_exactly_the_missing_packets() {
        let config = ProbeConfig::default();
        let data = payload(508 * 8);

        let (sender, receiver) = MemoryChannel::pair();
        let sender = sender.with_drop_filter(drop_attempts([(2, 1), (5, 1)].into_iter().collect()));

        let (_, _, sender) = transfer(config, &data, sender, receiver).await;

        let sent_packets = sender.sent_datagrams().iter()
            .filter_map(|d| packet_number_of(d))
            .collect::<Vec<_>>();
        assert_eq!(sent_packets, vec![0, 1, 2, 3, 4, 5, 6, 7, 2, 5]);

        // END_OF_TRANSMISSION is the last thing the sender sends
        assert_eq!(sender.sent_datagrams().last().unwrap(), &END_OF_TRANSMISSION.to_be_bytes().to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_loss() {
        let config = ProbeConfig::default();
        let data = payload(300_000);

        let (sender, receiver) = MemoryChannel::pair();
        let mut rng = StdRng::seed_from_u64(4711);
        let mut prev_packet_number = None;
        let sender = sender.with_drop_filter(move |datagram| {
            let Some(packet_number) = packet_number_of(datagram) else {
                return false;
            };
            // packet numbers ascend within a round, and the first packet of each round gets through
            let is_first_of_round = prev_packet_number.map_or(true, |prev| packet_number <= prev);
            prev_packet_number = Some(packet_number);
            !is_first_of_round && rng.random_bool(0.2)
        });

        let (send_stats, recv_stats, _) = transfer(config, &data, sender, receiver).await;
        assert!(send_stats.rounds > 1);
        assert_eq!(send_stats.resend_requests, recv_stats.resend_requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_do_not_corrupt() {
        let config = ProbeConfig {
            max_datagram_size: 12,
            ..Default::default()
        };
        let data = payload(20);
        let (sender, receiver) = MemoryChannel::pair();

        // packet 2 arrives ahead of the round, followed by a copy with different content
        let mut early = BytesMut::new();
        early.put_i32(2);
        early.put_slice(&data[16..]);
        receiver.inject(&early);
        let mut garbled = BytesMut::new();
        garbled.put_i32(2);
        garbled.put_slice(&[0xee; 4]);
        receiver.inject(&garbled);

        // packets 0 and 1 complete the message, the sender's own packet 2 is drained afterwards
        let (_, recv_stats, _) = transfer(config, &data, sender, receiver).await;
        assert_eq!(recv_stats.packets, 4);
        assert_eq!(recv_stats.duplicates, 1);
    }

    /// Loss recovery needs at least one packet of each round to arrive. If a whole resend round
    ///  is lost, the receiver waits for it without a time limit, and so does the sender.
    #[tokio::test(start_paused = true)]
    async fn test_lost_resend_round_blocks_both_sides() {
        let config = ProbeConfig::default();
        let data = payload(508 * 4);

        let (sender, receiver) = MemoryChannel::pair();
        let sender = sender.with_drop_filter(drop_attempts([(2, 2)].into_iter().collect()));

        let send_config = config.clone();
        let data_to_send = data.clone();
        let send_task = tokio::spawn(async move {
            send_bulk(&sender, &send_config, &data_to_send).await
        });

        let mut buf = vec![0u8; data.len()];
        let result = tokio::time::timeout(Duration::from_secs(60), recv_bulk(&receiver, &config, &mut buf)).await;
        assert!(result.is_err());
        assert!(!send_task.is_finished());
        send_task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_stray_datagrams() {
        let config = ProbeConfig::default();
        let data = payload(2000);
        let (sender, receiver) = MemoryChannel::pair();

        let mut out_of_range = BytesMut::new();
        out_of_range.put_i32(99);
        out_of_range.put_slice(&[1; 10]);
        receiver.inject(&out_of_range);
        receiver.inject(&[1, 2, 3]);
        let mut wrong_size = BytesMut::new();
        wrong_size.put_i32(3);
        wrong_size.put_slice(&[1; 10]);
        receiver.inject(&wrong_size);

        let (_, recv_stats, _) = transfer(config, &data, sender, receiver).await;
        assert_eq!(recv_stats.packets, 4);
        assert_eq!(recv_stats.duplicates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_finishes_without_end_of_transmission() {
        let config = ProbeConfig::default();
        let (sender, receiver) = MemoryChannel::pair();

        let mut packet = BytesMut::new();
        packet.put_i32(0);
        packet.put_slice(&[7; 100]);
        receiver.inject(&packet);

        let mut buf = vec![0u8; 100];
        let stats = recv_bulk(&receiver, &config, &mut buf).await.unwrap();
        assert_eq!(buf, vec![7; 100]);
        assert_eq!(stats.packets, 1);
        assert_eq!(sender.sent_datagrams().len(), 0);
        assert_eq!(receiver.sent_datagrams(), vec![0i32.to_be_bytes().to_vec()]);
    }

    /// two packets of 4 and 2 bytes, the second one is lost on the first attempt
    #[tokio::test]
    async fn test_receiver_wire_sequence() {
        let config = ProbeConfig {
            max_datagram_size: 8,
            ..Default::default()
        };

        let mut channel = MockDatagramChannel::new();
        let mut seq = Sequence::new();

        channel.expect_recv_datagram()
            .once()
            .in_sequence(&mut seq)
            .withf(|_, timeout| timeout.is_none())
            .returning(|buf, _| {
                buf[..8].copy_from_slice(&[0,0,0,0, 1,2,3,4]);
                Ok(Some(8))
            });
        channel.expect_recv_datagram()
            .once()
            .in_sequence(&mut seq)
            .withf(|_, timeout| *timeout == Some(Duration::from_millis(10)))
            .returning(|_, _| Ok(None));
        for expected in [[0u8,0,0,1], [0,0,0,1]] {
            channel.expect_send_datagram()
                .once()
                .in_sequence(&mut seq)
                .withf(move |buf| buf == expected)
                .returning(|_| Ok(()));
        }
        channel.expect_recv_datagram()
            .once()
            .in_sequence(&mut seq)
            .withf(|_, timeout| timeout.is_none())
            .returning(|buf, _| {
                buf[..6].copy_from_slice(&[0,0,0,1, 5,6]);
                Ok(Some(6))
            });
        channel.expect_send_datagram()
            .once()
            .in_sequence(&mut seq)
            .withf(|buf| buf == [0u8, 0, 0, 0])
            .returning(|_| Ok(()));
        channel.expect_recv_datagram()
            .once()
            .in_sequence(&mut seq)
            .withf(|_, timeout| *timeout == Some(Duration::from_millis(100)))
            .returning(|buf, _| {
                buf[..4].copy_from_slice(&END_OF_TRANSMISSION.to_be_bytes());
                Ok(Some(4))
            });

        let mut buf = vec![0u8; 6];
        let stats = recv_bulk(&channel, &config, &mut buf).await.unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(stats, BulkTransferStats {
            rounds: 2,
            packets: 2,
            duplicates: 0,
            resend_requests: 1,
        });
    }

    #[rstest]
    #[case::negative_count(vec![255, 255, 255, 255], None)]
    #[case::too_many(vec![0, 0, 0, 3], None)]
    #[case::out_of_range(vec![0, 0, 0, 1], Some(vec![0u8, 0, 0, 2]))]
    #[case::negative_packet(vec![0, 0, 0, 1], Some(vec![255u8, 255, 255, 255]))]
    #[tokio::test]
    async fn test_sender_rejects_invalid_resend_request(#[case] count: Vec<u8>, #[case] list: Option<Vec<u8>>) {
        let config = ProbeConfig {
            max_datagram_size: 8,
            ..Default::default()
        };

        let mut channel = MockDatagramChannel::new();
        let mut seq = Sequence::new();
        channel.expect_send_datagram()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel.expect_recv_datagram()
            .once()
            .in_sequence(&mut seq)
            .returning(move |buf, _| {
                buf[..4].copy_from_slice(&count);
                Ok(Some(4))
            });
        if let Some(list) = list {
            channel.expect_recv_datagram()
                .once()
                .in_sequence(&mut seq)
                .returning(move |buf, _| {
                    buf[..4].copy_from_slice(&list);
                    Ok(Some(4))
                });
        }

        let e = send_bulk(&channel, &config, &[1, 2, 3, 4, 5, 6]).await.unwrap_err();
        assert!(matches!(ProtocolError::of(&e), Some(ProtocolError::ProtocolViolation(_))));
    }

    #[test]
    fn test_pending_packets() {
        let mut pending = PendingPackets::new(5);
        assert_eq!(pending.len(), 5);
        assert_eq!(pending.to_vec(), vec![0, 1, 2, 3, 4]);

        assert!(pending.on_received(3));
        assert!(!pending.on_received(3));
        assert!(pending.on_received(0));
        assert!(!pending.is_pending(0));
        assert!(pending.is_pending(1));
        assert_eq!(pending.to_vec(), vec![1, 2, 4]);

        for n in [1, 2, 4] {
            pending.on_received(n);
        }
        assert!(pending.is_empty());
    }

    #[rstest]
    #[case::empty(0, 0, 0..0)]
    #[case::partial(100, 1, 0..100)]
    #[case::exact(1016, 2, 508..1016)]
    #[case::remainder(1017, 3, 1016..1017)]
    fn test_packet_layout(#[case] len: usize, #[case] expected_count: usize, #[case] last_range: Range<usize>) {
        let layout = PacketLayout::new(len, 508).unwrap();
        assert_eq!(layout.packet_count, expected_count);
        if expected_count > 0 {
            assert_eq!(layout.range(expected_count - 1), last_range);
        }
        assert_eq!(layout.packet_number(expected_count as i32), None);
        assert_eq!(layout.packet_number(-1), None);
    }
}
