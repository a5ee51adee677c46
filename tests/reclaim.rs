mod common;

use norlog::{PageRange, PartitionId, PartitionRequest, Storage};

const CRASHLOG_PAGE_0: u32 = 2 * 4096;

fn formatted(flash: &mut common::Flash) -> Storage<&mut common::Flash> {
    let mut storage = Storage::new(flash).unwrap();
    storage
        .format(
            &[PartitionRequest {
                id: PartitionId::Crashlog,
                block_count: 5,
            }],
            false,
        )
        .unwrap();
    storage
}

/// Reads and invalidates `pages` pages from the read cursor on.
fn consume(storage: &mut Storage<&mut common::Flash>, pages: usize) -> usize {
    let mut buf = vec![0u8; pages * 256];
    let mut range = PageRange::new();
    storage
        .read(PartitionId::Crashlog, &mut buf, &mut range)
        .unwrap();
    storage.mark_dirty(PartitionId::Crashlog, &mut range).unwrap()
}

mod reclaim {
    use super::{CRASHLOG_PAGE_0, consume, formatted};
    use crate::common::{self, F, U};
    use norlog::error::Error;
    use norlog::{Cursor, PageRange, PageStatistics, PartitionId, PartitionRequest, Storage};
    use pretty_assertions::assert_eq;

    #[test]
    fn nothing_to_reclaim() {
        let mut flash = common::Flash::new(16);
        let erases = {
            let mut storage = formatted(&mut flash);
            storage.append(PartitionId::Crashlog, &[1; 4096]).unwrap();
            assert_eq!(storage.reclaim(PartitionId::Crashlog), Ok(0));
            assert_eq!(storage.reclaim(PartitionId::Data), Ok(0));
            drop(storage);
            flash.erases()
        };

        // the two blocks of the format
        assert_eq!(erases, 2);
    }

    #[test]
    fn erases_invalidated_blocks() {
        let mut flash = common::Flash::new(16);
        {
            let mut storage = formatted(&mut flash);
            for i in 0u8..33 {
                storage.append(PartitionId::Crashlog, &[i; 256]).unwrap();
            }
            assert_eq!(consume(&mut storage, 16), 16);

            assert_eq!(storage.reclaim(PartitionId::Crashlog), Ok(1));
            assert_eq!(
                storage.statistics(PartitionId::Crashlog).unwrap(),
                PageStatistics {
                    free: 63,
                    used: 17,
                    dirty: 0,
                    bad: 0,
                    min_free_bytes: 63 * 256,
                }
            );
            assert_eq!(storage.free_page_count(PartitionId::Crashlog), Ok(63));
            assert_eq!(
                storage.read_cursor(PartitionId::Crashlog),
                Ok(Cursor::new(4100, 0))
            );
            assert_eq!(
                storage.write_cursor(PartitionId::Crashlog),
                Ok(Some(Cursor::new(4104, 1)))
            );

            let mut buf = [0u8; 256];
            let mut range = PageRange::new();
            storage
                .read(PartitionId::Crashlog, &mut buf, &mut range)
                .unwrap();
            assert_eq!(buf, [16u8; 256]);
        }

        // format, then the data block and the bitmap block
        assert_eq!(flash.erased_blocks(), vec![0, 1, 2, 1]);
        assert!(flash.page(CRASHLOG_PAGE_0).iter().all(|&byte| byte == 0xFF));

        assert_eq!(flash.bitmap_word(4096), common::ALL_FREE);
        assert_eq!(flash.bitmap_word(4100), common::ALL_USED);
        assert_eq!(
            flash.bitmap_word(4104),
            common::word([U, F, F, F, F, F, F, F, F, F, F, F, F, F, F, F])
        );
    }

    #[test]
    fn never_erases_used_pages() {
        let mut flash = common::Flash::new(16);
        let mut storage = formatted(&mut flash);

        for i in 0u8..16 {
            storage.append(PartitionId::Crashlog, &[i; 256]).unwrap();
        }
        assert_eq!(consume(&mut storage, 15), 15);

        assert_eq!(storage.reclaim(PartitionId::Crashlog), Ok(0));
        assert_eq!(storage.statistics(PartitionId::Crashlog).unwrap().used, 1);
    }

    #[test]
    fn bad_only_blocks_are_reclaimed() {
        let mut flash = common::Flash::new(16);
        let mut storage = formatted(&mut flash);

        for element in 0..16 {
            storage
                .mark_bad(PartitionId::Crashlog, Cursor::new(4096, element))
                .unwrap();
        }

        assert_eq!(storage.reclaim(PartitionId::Crashlog), Ok(1));
        assert_eq!(
            storage.statistics(PartitionId::Crashlog).unwrap(),
            PageStatistics {
                free: 80,
                used: 0,
                dirty: 0,
                bad: 0,
                min_free_bytes: 80 * 256,
            }
        );
        assert_eq!(
            storage.write_cursor(PartitionId::Crashlog),
            Ok(Some(Cursor::new(4096, 0)))
        );
    }

    #[test]
    fn capacity_comes_back_after_forced_format() {
        let mut flash = common::Flash::new(16);
        let mut storage = formatted(&mut flash);
        storage
            .append(PartitionId::Crashlog, &[7; 40 * 256])
            .unwrap();

        storage
            .format(
                &[PartitionRequest {
                    id: PartitionId::Crashlog,
                    block_count: 5,
                }],
                true,
            )
            .unwrap();

        // the old pages fail the blank check
        storage.append(PartitionId::Crashlog, &[8; 256]).unwrap();
        assert_eq!(
            storage.statistics(PartitionId::Crashlog).unwrap(),
            PageStatistics {
                free: 39,
                used: 1,
                dirty: 0,
                bad: 40,
                min_free_bytes: 39 * 256,
            }
        );

        // the third block still holds the new page
        assert_eq!(storage.reclaim(PartitionId::Crashlog), Ok(2));
        assert_eq!(
            storage.statistics(PartitionId::Crashlog).unwrap(),
            PageStatistics {
                free: 71,
                used: 1,
                dirty: 0,
                bad: 8,
                min_free_bytes: 71 * 256,
            }
        );

        let mut buf = [0u8; 256];
        let mut range = PageRange::new();
        assert_eq!(
            storage.read(PartitionId::Crashlog, &mut buf, &mut range),
            Ok(256)
        );
        assert_eq!(buf, [8u8; 256]);
    }

    #[test]
    fn dirty_and_bad_block() {
        let mut flash = common::Flash::new(16);
        let mut storage = formatted(&mut flash);

        storage
            .mark_bad(PartitionId::Crashlog, Cursor::new(4096, 0))
            .unwrap();
        for i in 0u8..15 {
            storage.append(PartitionId::Crashlog, &[i; 256]).unwrap();
        }
        assert_eq!(consume(&mut storage, 15), 15);

        assert_eq!(storage.reclaim(PartitionId::Crashlog), Ok(1));
        assert_eq!(
            storage.statistics(PartitionId::Crashlog).unwrap(),
            PageStatistics {
                free: 80,
                used: 0,
                dirty: 0,
                bad: 0,
                min_free_bytes: 80 * 256,
            }
        );
    }

    #[test]
    fn neighbours_survive_bitmap_rewrite() {
        let mut flash = common::Flash::new(16);
        {
            let mut storage = formatted(&mut flash);
            for i in 0u8..16 {
                storage.append(PartitionId::Crashlog, &[i; 256]).unwrap();
            }
            storage.append(PartitionId::Data, &[0xDA; 600]).unwrap();
            let data_statistics = storage.statistics(PartitionId::Data).unwrap();

            assert_eq!(consume(&mut storage, 16), 16);
            assert_eq!(storage.reclaim(PartitionId::Crashlog), Ok(1));

            assert_eq!(storage.statistics(PartitionId::Data), Ok(data_statistics));
        }

        let mut storage = Storage::new(&mut flash).unwrap();
        storage.init().unwrap();
        assert_eq!(storage.statistics(PartitionId::Data).unwrap().used, 3);

        let mut buf = [0u8; 600];
        let mut range = PageRange::new();
        assert_eq!(
            storage.read(PartitionId::Data, &mut buf, &mut range),
            Ok(600)
        );
        assert_eq!(buf, [0xDA; 600]);
    }

    #[test]
    fn unknown_partition() {
        let mut flash = common::Flash::new(16);
        let mut storage = formatted(&mut flash);

        assert_eq!(
            storage.reclaim(PartitionId::Settings),
            Err(Error::NotFound)
        );
        assert_eq!(
            storage.reclaim(PartitionId::Bitmap),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            storage.free_page_count(PartitionId::Bitmap),
            Err(Error::InvalidParameter)
        );
    }
}

mod mark_bad {
    use super::formatted;
    use crate::common::{self, B, F, U};
    use norlog::error::Error;
    use norlog::{Cursor, PartitionId};
    use pretty_assertions::assert_eq;

    #[test]
    fn write_cursor_moves_on() {
        let mut flash = common::Flash::new(16);
        {
            let mut storage = formatted(&mut flash);
            storage
                .mark_bad(PartitionId::Crashlog, Cursor::new(4096, 0))
                .unwrap();
            assert_eq!(
                storage.write_cursor(PartitionId::Crashlog),
                Ok(Some(Cursor::new(4096, 1)))
            );

            // not the write cursor, nothing moves
            storage
                .mark_bad(PartitionId::Crashlog, Cursor::new(4096, 2))
                .unwrap();
            assert_eq!(
                storage.write_cursor(PartitionId::Crashlog),
                Ok(Some(Cursor::new(4096, 1)))
            );

            storage.append(PartitionId::Crashlog, &[1; 512]).unwrap();
            assert_eq!(
                storage.write_cursor(PartitionId::Crashlog),
                Ok(Some(Cursor::new(4096, 4)))
            );
            assert_eq!(storage.statistics(PartitionId::Crashlog).unwrap().bad, 2);
        }

        assert_eq!(
            flash.bitmap_word(4096),
            common::word([B, U, B, U, F, F, F, F, F, F, F, F, F, F, F, F])
        );
    }

    #[test]
    fn last_free_page() {
        let mut flash = common::Flash::new(16);
        let mut storage = formatted(&mut flash);

        let _ = storage.append(PartitionId::Crashlog, &vec![0; 79 * 256]);
        assert_eq!(
            storage.write_cursor(PartitionId::Crashlog),
            Ok(Some(Cursor::new(4112, 15)))
        );

        storage
            .mark_bad(PartitionId::Crashlog, Cursor::new(4112, 15))
            .unwrap();
        assert_eq!(storage.write_cursor(PartitionId::Crashlog), Ok(None));
    }

    #[test]
    fn only_free_pages() {
        let mut flash = common::Flash::new(16);
        let mut storage = formatted(&mut flash);
        storage.append(PartitionId::Crashlog, &[1; 256]).unwrap();

        assert_eq!(
            storage.mark_bad(PartitionId::Crashlog, Cursor::new(4096, 0)),
            Err(Error::MediaError)
        );
        assert_eq!(
            storage.mark_bad(PartitionId::Crashlog, Cursor::new(4116, 0)),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            storage.mark_bad(PartitionId::Crashlog, Cursor::new(4096, 16)),
            Err(Error::InvalidParameter)
        );
        assert_eq!(storage.statistics(PartitionId::Crashlog).unwrap().bad, 0);
    }
}
