//! Device, board and firmware picked by the user.
//!
//! Every setter validates against the catalog and clears the choices below it, so a selection is
//! never out of step with the catalog it was built from.

use crate::{Board, Catalog, Device, Error, Firmware, Result};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Selection {
    device: Option<String>,
    board: Option<String>,
    firmware: Option<String>,
}

impl Selection {
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn board(&self) -> Option<&str> {
        self.board.as_deref()
    }

    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    pub fn select_device(&mut self, catalog: &Catalog, model: &str) -> Result<()> {
        if catalog.device(model).is_none() {
            return Err(Error::UnknownDevice(model.to_string()));
        }

        self.device = Some(model.to_string());
        self.board = None;
        self.firmware = None;

        Ok(())
    }

    pub fn select_board(&mut self, catalog: &Catalog, version: &str) -> Result<()> {
        let device = self.device.as_deref().ok_or(Error::NoDevice)?;

        if catalog.board(device, version).is_none() {
            return Err(Error::UnknownBoard {
                device: device.to_string(),
                board: version.to_string(),
            });
        }

        self.board = Some(version.to_string());
        self.firmware = None;

        Ok(())
    }

    pub fn select_firmware(&mut self, catalog: &Catalog, version: &str) -> Result<()> {
        let device = self.device.as_deref().ok_or(Error::NoDevice)?;
        let board = self.board.as_deref().ok_or(Error::NoBoard)?;

        if catalog.firmware(device, board, version).is_none() {
            return Err(Error::UnknownFirmware {
                board: board.to_string(),
                firmware: version.to_string(),
            });
        }

        self.firmware = Some(version.to_string());

        Ok(())
    }

    /// Boards valid for the selected device.
    pub fn available_boards<'a>(&self, catalog: &'a Catalog) -> &'a [Board] {
        match &self.device {
            Some(d) => catalog.boards(d),
            None => &[],
        }
    }

    /// Firmwares valid for the selected board.
    pub fn available_firmwares<'a>(&self, catalog: &'a Catalog) -> &'a [Firmware] {
        match (&self.device, &self.board) {
            (Some(d), Some(b)) => catalog.firmwares(d, b),
            _ => &[],
        }
    }

    /// Device and board are chosen, and the board has something to flash.
    pub fn is_complete(&self, catalog: &Catalog) -> bool {
        self.resolved(catalog).is_some()
    }

    /// Full selection. Falls back to the latest firmware of the board if none was picked.
    pub fn resolved<'a>(
        &self,
        catalog: &'a Catalog,
    ) -> Option<(&'a Device, &'a Board, &'a Firmware)> {
        let device = catalog.device(self.device.as_deref()?)?;
        let board = catalog.board(&device.model, self.board.as_deref()?)?;
        let firmware = match self.firmware.as_deref() {
            Some(v) => catalog.firmware(&device.model, &board.version, v)?,
            None => board.latest()?,
        };

        Some((device, board, firmware))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::from_json(
            br#"{"devices":[
                {"model":"ultra","name":"Ultra","boards":[
                    {"version":"202","firmwares":[
                        {"version":"v2.1.9","path":"a.bin"},
                        {"version":"v2.1.10","path":"b.bin"}
                    ]},
                    {"version":"204","firmwares":[{"version":"v2.1.10","path":"c.bin"}]}
                ]},
                {"model":"gamma","name":"Gamma","boards":[
                    {"version":"601","firmwares":[{"version":"v2.2.0","path":"d.bin"}]}
                ]}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn device_populates_its_boards() {
        let catalog = catalog();
        let mut sel = Selection::default();
        assert!(sel.available_boards(&catalog).is_empty());

        sel.select_device(&catalog, "ultra").unwrap();
        let boards: Vec<_> = sel
            .available_boards(&catalog)
            .iter()
            .map(|b| b.version.as_str())
            .collect();
        assert_eq!(boards, ["202", "204"]);

        sel.select_device(&catalog, "gamma").unwrap();
        let boards: Vec<_> = sel
            .available_boards(&catalog)
            .iter()
            .map(|b| b.version.as_str())
            .collect();
        assert_eq!(boards, ["601"]);
    }

    #[test]
    fn board_populates_its_firmwares() {
        let catalog = catalog();
        let mut sel = Selection::default();
        sel.select_device(&catalog, "ultra").unwrap();
        assert!(sel.available_firmwares(&catalog).is_empty());

        sel.select_board(&catalog, "202").unwrap();
        let fws: Vec<_> = sel
            .available_firmwares(&catalog)
            .iter()
            .map(|f| f.version.as_str())
            .collect();
        assert_eq!(fws, ["v2.1.9", "v2.1.10"]);
    }

    #[test]
    fn changing_device_clears_board() {
        let catalog = catalog();
        let mut sel = Selection::default();
        sel.select_device(&catalog, "ultra").unwrap();
        sel.select_board(&catalog, "204").unwrap();
        sel.select_firmware(&catalog, "v2.1.10").unwrap();

        sel.select_device(&catalog, "gamma").unwrap();
        assert_eq!(sel.board(), None);
        assert_eq!(sel.firmware(), None);
        assert!(!sel.is_complete(&catalog));
    }

    #[test]
    fn rejects_out_of_scope() {
        let catalog = catalog();
        let mut sel = Selection::default();

        assert!(matches!(
            sel.select_board(&catalog, "202"),
            Err(Error::NoDevice)
        ));
        assert!(matches!(
            sel.select_device(&catalog, "max"),
            Err(Error::UnknownDevice(_))
        ));

        sel.select_device(&catalog, "gamma").unwrap();
        assert!(matches!(
            sel.select_board(&catalog, "202"),
            Err(Error::UnknownBoard { .. })
        ));
        assert!(matches!(
            sel.select_firmware(&catalog, "v2.2.0"),
            Err(Error::NoBoard)
        ));

        sel.select_board(&catalog, "601").unwrap();
        assert!(matches!(
            sel.select_firmware(&catalog, "v2.1.10"),
            Err(Error::UnknownFirmware { .. })
        ));
        // Failed selections leave the previous state intact
        assert_eq!(sel.board(), Some("601"));
    }

    #[test]
    fn resolved_uses_latest() {
        let catalog = catalog();
        let mut sel = Selection::default();
        sel.select_device(&catalog, "ultra").unwrap();
        assert!(sel.resolved(&catalog).is_none());

        sel.select_board(&catalog, "202").unwrap();
        let (_, _, fw) = sel.resolved(&catalog).unwrap();
        assert_eq!(fw.version, "v2.1.10");

        sel.select_firmware(&catalog, "v2.1.9").unwrap();
        let (d, b, fw) = sel.resolved(&catalog).unwrap();
        assert_eq!((d.name.as_str(), b.version.as_str()), ("Ultra", "202"));
        assert_eq!(fw.path, "a.bin");
    }

    #[test]
    fn board_without_firmware_is_incomplete() {
        let catalog = Catalog::builtin();
        let mut sel = Selection::default();
        sel.select_device(&catalog, "ultrahex").unwrap();
        assert!(sel.available_boards(&catalog).is_empty());
        assert!(!sel.is_complete(&catalog));
    }
}
