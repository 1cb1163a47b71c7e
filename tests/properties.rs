use std::time::Duration;

use futures::executor::block_on;
use proptest::prelude::*;

use overlapped_serial::loopback::Loopback;
use overlapped_serial::{Error, PortSettings, SerialPort, TimeoutMode};

fn immediate_port() -> (Loopback, SerialPort<Loopback>) {
    let driver = Loopback::new();
    let settings = PortSettings::default().with_timeout(TimeoutMode::Immediate, Duration::from_secs(1));
    let port = SerialPort::new(driver.clone(), "loop", settings);
    port.open().unwrap();
    (driver, port)
}

proptest! {
    #[test]
    fn transfers_never_exceed_the_requested_count(
        len in 0usize..256,
        offset in 0usize..256,
        count in 0usize..256,
        waiting in 0usize..512,
    ) {
        let (driver, port) = immediate_port();
        driver.feed(&vec![0x5a; waiting]);

        let (res, buf) = block_on(port.read(vec![0u8; len], offset, count, None));
        prop_assert_eq!(buf.len(), len);
        if offset + count <= len {
            let n = res.unwrap();
            prop_assert!(n <= count);
            prop_assert_eq!(n, count.min(waiting));
            prop_assert!(buf[..offset].iter().all(|&b| b == 0));
            prop_assert!(buf[offset + count..].iter().all(|&b| b == 0));
        } else {
            prop_assert!(matches!(res, Err(Error::InvalidArgument(_))));
            prop_assert_eq!(driver.submitted(), 0);
        }
        prop_assert_eq!(port.pending_operations(), 0);
    }

    #[test]
    fn writes_place_exactly_the_selected_bytes_on_the_wire(
        data in proptest::collection::vec(any::<u8>(), 0..512),
        split in any::<prop::sample::Index>(),
        take in any::<prop::sample::Index>(),
    ) {
        let (driver, port) = immediate_port();
        let offset = if data.is_empty() { 0 } else { split.index(data.len() + 1) };
        let count = take.index(data.len() - offset + 1);

        let (res, _) = block_on(port.write(data.clone(), offset, count, None));
        prop_assert_eq!(res.unwrap(), count);
        prop_assert_eq!(driver.buffered(), count);

        let (res, echoed) = block_on(port.read(vec![0u8; count], 0, count, None));
        prop_assert_eq!(res.unwrap(), count);
        prop_assert_eq!(&echoed[..], &data[offset..offset + count]);
    }
}
