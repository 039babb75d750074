use nimbus_usb::SgBuffer;
use proptest::collection::vec;
use proptest::prelude::*;

fn fragments() -> impl Strategy<Value = Vec<Vec<u8>>> {
    vec(vec(any::<u8>(), 0..32), 1..8)
}

proptest! {
    #[test]
    fn fragmented_buffer_behaves_like_flat(frags in fragments(), writes in vec((any::<usize>(), vec(any::<u8>(), 0..48)), 0..8)) {
        let mut buf = SgBuffer::from_segments(frags.clone());
        let mut flat: Vec<u8> = frags.concat();
        prop_assert_eq!(buf.len(), flat.len());

        for (offset, data) in writes {
            let offset = if flat.is_empty() { 0 } else { offset % (flat.len() + 1) };
            let fits = offset + data.len() <= flat.len();
            let res = buf.write_at(offset, &data);
            prop_assert_eq!(res.is_ok(), fits);
            if fits {
                flat[offset..offset + data.len()].copy_from_slice(&data);
            }
        }
        prop_assert_eq!(buf.to_vec(), flat);
    }

    #[test]
    fn read_at_matches_flat_view(frags in fragments(), offset in any::<usize>(), len in 0usize..64) {
        let buf = SgBuffer::from_segments(frags.clone());
        let flat: Vec<u8> = frags.concat();
        let offset = if flat.is_empty() { 0 } else { offset % (flat.len() + 1) };

        let mut out = vec![0u8; len];
        let res = buf.read_at(offset, &mut out);
        if offset + len <= flat.len() {
            prop_assert!(res.is_ok());
            prop_assert_eq!(&out[..], &flat[offset..offset + len]);
        } else {
            prop_assert!(res.is_err());
        }
    }
}
