use nexus_core::{Header, Packet, HEADER_SIZE, MAGIC, PROTOCOL_VERSION};
use rand::{thread_rng, Rng};

#[test]
fn fuzz_decode_packet_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..2048);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = Packet::decode(&data);
    }
}

#[test]
fn fuzz_decode_header_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..64);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = Header::decode(&data);
    }
}

#[test]
fn random_mutation_of_valid_packet_is_handled() {
    let mut rng = thread_rng();
    let mut packet = vec![0u8; HEADER_SIZE + 16];
    packet[0..2].copy_from_slice(&MAGIC.to_le_bytes());
    packet[2] = PROTOCOL_VERSION;
    packet[3] = 0x0B; // ping

    for _ in 0..1_000 {
        let mut mutated = packet.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        let _ = Packet::decode(&mutated);
    }
}

#[test]
fn random_well_formed_packets_recode_exactly() {
    let mut rng = thread_rng();
    for _ in 0..1_000 {
        let mut frame = vec![0u8; HEADER_SIZE + 8];
        frame[0..2].copy_from_slice(&MAGIC.to_le_bytes());
        frame[2] = PROTOCOL_VERSION;
        frame[3] = 0x0B;
        frame[4..6].copy_from_slice(&rng.gen::<u16>().to_le_bytes());
        frame[6] = rng.gen();
        frame[7] = rng.gen();
        frame[HEADER_SIZE..].copy_from_slice(&rng.gen::<u64>().to_le_bytes());

        let packet = Packet::decode(&frame).expect("well-formed ping");
        assert_eq!(packet.encode().expect("recode"), frame);
    }
}
