//! Host-based end-to-end tests for the firmware updater
//! These run the public `Updater` against scripted collaborators on the
//! development machine, not on the ESP32
